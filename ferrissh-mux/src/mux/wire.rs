//! RFC 4254 encodings of channel-open parameters.
//!
//! The engine hands us decoded open parameters; they are re-encoded into
//! the opaque `extra_data` of a [`NewChannel`](super::NewChannel) so every
//! consumer sees the same wire layout regardless of the channel type.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Encoding failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// A field does not fit the 32-bit length prefix of an SSH string.
    #[error("{0} byte field exceeds the SSH string length limit")]
    TooLong(usize),
}

fn string_len(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::TooLong(len))
}

/// Append `s` as an SSH string. Nothing is written on error.
pub(crate) fn put_string(buf: &mut BytesMut, s: &[u8]) -> Result<(), WireError> {
    buf.put_u32(string_len(s.len())?);
    buf.put_slice(s);
    Ok(())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Option<u32> {
    (buf.remaining() >= 4).then(|| buf.get_u32())
}

pub(crate) fn get_string(buf: &mut Bytes) -> Option<Bytes> {
    let len = get_u32(buf)? as usize;
    (buf.remaining() >= len).then(|| buf.split_to(len))
}

fn get_utf8(buf: &mut Bytes) -> Option<String> {
    String::from_utf8(get_string(buf)?.to_vec()).ok()
}

/// Parameters of `forwarded-tcpip` and `direct-tcpip` opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpipOpen {
    /// Address that was connected (forwarded) or should be connected to (direct).
    pub address: String,
    /// Port matching `address`.
    pub port: u32,
    /// Address of the peer that initiated the connection.
    pub originator_address: String,
    /// Port of the initiating peer.
    pub originator_port: u32,
}

impl TcpipOpen {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(16 + self.address.len() + self.originator_address.len());
        put_string(&mut buf, self.address.as_bytes())?;
        buf.put_u32(self.port);
        put_string(&mut buf, self.originator_address.as_bytes())?;
        buf.put_u32(self.originator_port);
        Ok(buf.freeze())
    }

    /// Parse the payload; trailing bytes are rejected.
    pub fn decode(mut data: Bytes) -> Option<Self> {
        let open = Self {
            address: get_utf8(&mut data)?,
            port: get_u32(&mut data)?,
            originator_address: get_utf8(&mut data)?,
            originator_port: get_u32(&mut data)?,
        };
        data.is_empty().then_some(open)
    }
}

/// Parameters of `forwarded-streamlocal@openssh.com` opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLocalOpen {
    /// Remote socket path the connection arrived on.
    pub socket_path: String,
}

impl StreamLocalOpen {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(8 + self.socket_path.len());
        put_string(&mut buf, self.socket_path.as_bytes())?;
        // reserved
        put_string(&mut buf, b"")?;
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> Option<Self> {
        let socket_path = get_utf8(&mut data)?;
        get_string(&mut data)?;
        data.is_empty().then_some(Self { socket_path })
    }
}

/// Parameters of `x11` opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Open {
    pub originator_address: String,
    pub originator_port: u32,
}

impl X11Open {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(8 + self.originator_address.len());
        put_string(&mut buf, self.originator_address.as_bytes())?;
        buf.put_u32(self.originator_port);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcpip_layout() {
        let open = TcpipOpen {
            address: "10.0.0.1".into(),
            port: 8080,
            originator_address: "1.2.3.4".into(),
            originator_port: 5555,
        };
        let data = open.encode().unwrap();
        assert_eq!(&data[..4], &[0, 0, 0, 8]);
        assert_eq!(&data[4..12], b"10.0.0.1");
        assert_eq!(TcpipOpen::decode(data), Some(open));
    }

    #[test]
    fn test_tcpip_rejects_truncated_and_trailing() {
        let data = TcpipOpen {
            address: "h".into(),
            port: 1,
            originator_address: "o".into(),
            originator_port: 2,
        }
        .encode()
        .unwrap();

        assert_eq!(TcpipOpen::decode(data.slice(..data.len() - 1)), None);

        let mut long = BytesMut::from(&data[..]);
        long.put_u8(0);
        assert_eq!(TcpipOpen::decode(long.freeze()), None);
    }

    #[test]
    fn test_streamlocal_layout() {
        let open = StreamLocalOpen {
            socket_path: "/tmp/agent.sock".into(),
        };
        let data = open.encode().unwrap();
        assert_eq!(data.len(), 4 + 15 + 4);
        assert_eq!(StreamLocalOpen::decode(data), Some(open));
    }

    #[test]
    fn test_string_length_overrun() {
        let mut data = Bytes::from_static(&[0, 0, 0, 9, b'a']);
        assert_eq!(get_string(&mut data), None);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_oversized_string_is_refused() {
        let len = u32::MAX as usize + 1;
        assert_eq!(string_len(len), Err(WireError::TooLong(len)));
        assert_eq!(string_len(u32::MAX as usize), Ok(u32::MAX));
    }

    #[test]
    fn test_put_string_prefixes_length() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"abc").unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
