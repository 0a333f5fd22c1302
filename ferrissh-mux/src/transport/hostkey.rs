//! Host key policies and signature verification.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use russh::keys::PublicKey;
use russh::keys::ssh_key::{Algorithm, Signature};
use signature::Verifier;

use super::config::HostKeyCallback;
use crate::error::HostKeyError;
use crate::mux::wire::get_string;

/// Accept any host key.
///
/// This disables server authentication entirely and leaves the connection
/// open to man-in-the-middle attacks. Use it for tests only.
pub fn insecure_ignore_host_key() -> HostKeyCallback {
    Arc::new(|_: &str, _: SocketAddr, _: &PublicKey| -> Result<(), HostKeyError> { Ok(()) })
}

/// Accept exactly one host key.
#[derive(Debug, Clone)]
pub struct FixedHostKey {
    key: Option<PublicKey>,
}

impl FixedHostKey {
    pub fn new(key: Option<PublicKey>) -> Self {
        Self { key }
    }

    /// Compare the canonical encodings of the configured and offered keys.
    pub fn check(
        &self,
        host: &str,
        _remote: SocketAddr,
        key: &PublicKey,
    ) -> Result<(), HostKeyError> {
        let expected = self.key.as_ref().ok_or(HostKeyError::NoFixedKey)?;
        if encode(expected)? != encode(key)? {
            warn!("host key mismatch for {}", host);
            return Err(HostKeyError::Mismatch {
                host: host.to_string(),
            });
        }
        Ok(())
    }

    pub fn into_callback(self) -> HostKeyCallback {
        Arc::new(move |host: &str, remote: SocketAddr, key: &PublicKey| {
            self.check(host, remote, key)
        })
    }
}

/// Accept only `key`.
pub fn fixed_host_key(key: PublicKey) -> HostKeyCallback {
    FixedHostKey::new(Some(key)).into_callback()
}

fn encode(key: &PublicKey) -> Result<Vec<u8>, HostKeyError> {
    key.to_bytes()
        .map_err(|e| HostKeyError::Encoding(e.to_string()))
}

/// Host key checking mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KnownHostsPolicy {
    /// Reject unknown and changed keys. Connection fails if the host
    /// is not already in known_hosts.
    Strict,

    /// Accept and learn unknown keys, but reject changed keys.
    #[default]
    AcceptNew,

    /// Accept all keys without checking. For testing and lab use only.
    Disabled,
}

/// Check keys against an OpenSSH `known_hosts` file.
///
/// `path` defaults to `~/.ssh/known_hosts`.
pub fn known_hosts(policy: KnownHostsPolicy, path: Option<PathBuf>) -> HostKeyCallback {
    let store = KnownHosts { path };
    Arc::new(move |hostname: &str, remote: SocketAddr, key: &PublicKey| -> Result<(), HostKeyError> {
        let (host, port) = split_host_port(hostname, remote.port());
        match policy {
            KnownHostsPolicy::Disabled => Ok(()),
            KnownHostsPolicy::AcceptNew => match store.check(host, port, key)? {
                true => Ok(()),
                false => {
                    debug!("learning host key for {}:{}", host, port);
                    if let Err(e) = store.learn(host, port, key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(())
                }
            },
            KnownHostsPolicy::Strict => match store.check(host, port, key)? {
                true => Ok(()),
                false => Err(HostKeyError::Unknown {
                    host: host.to_string(),
                    port,
                }),
            },
        }
    })
}

struct KnownHosts {
    path: Option<PathBuf>,
}

impl KnownHosts {
    /// `Ok(true)` if matched, `Ok(false)` if the host is not listed.
    fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, HostKeyError> {
        let result = match &self.path {
            Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
            None => russh::keys::check_known_hosts(host, port, key),
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!("host key for {}:{} changed (line {})", host, port, line);
                Err(HostKeyError::Changed {
                    host: host.to_string(),
                    port,
                    line,
                })
            }
            Err(e) => Err(HostKeyError::KnownHosts(e.to_string())),
        }
    }

    fn learn(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), HostKeyError> {
        let result = match &self.path {
            Some(path) => russh::keys::known_hosts::learn_known_hosts_path(host, port, key, path),
            None => russh::keys::known_hosts::learn_known_hosts(host, port, key),
        };
        result.map_err(|e| HostKeyError::KnownHosts(e.to_string()))
    }
}

/// Split `host:port` (or `[v6]:port`); a bare host gets `default_port`.
fn split_host_port(hostname: &str, default_port: u16) -> (&str, u16) {
    if let Some(rest) = hostname.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host, port);
        }
    }
    match hostname.rsplit_once(':') {
        // a second colon means an unbracketed IPv6 literal
        Some((host, port)) if !host.contains(':') => {
            (host, port.parse().unwrap_or(default_port))
        }
        _ => (hostname, default_port),
    }
}

/// Verify an SSH signature blob (`string format, string signature`) made by
/// `host_key` over `data`.
///
/// Trailing bytes after the signature are rejected.
///
/// This is a standalone helper for callers checking signatures outside the
/// handshake, such as `hostkeys-prove-00@openssh.com` replies. The
/// exchange-hash signature made during key exchange is verified by russh
/// itself and does not pass through here.
pub fn verify_host_key_signature(
    host_key: &PublicKey,
    data: &[u8],
    blob: &[u8],
) -> Result<(), HostKeyError> {
    let mut buf = Bytes::copy_from_slice(blob);
    let format = get_string(&mut buf).ok_or(HostKeyError::SignatureParse)?;
    let sig = get_string(&mut buf).ok_or(HostKeyError::SignatureParse)?;
    if !buf.is_empty() {
        return Err(HostKeyError::SignatureParse);
    }

    let format = std::str::from_utf8(&format).map_err(|_| HostKeyError::SignatureParse)?;
    let algorithm = Algorithm::new(format).map_err(|_| HostKeyError::SignatureParse)?;
    let signature = Signature::new(algorithm, sig.to_vec())
        .map_err(|e| HostKeyError::SignatureInvalid(e.to_string()))?;

    Verifier::verify(host_key.key_data(), data, &signature)
        .map_err(|e| HostKeyError::SignatureInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::mux::wire::put_string;

    const HOST_A: &str = include_str!("../../tests/fixtures/host_a.pub");
    const HOST_B: &str = include_str!("../../tests/fixtures/host_b.pub");

    const SIGNER: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPWgZCYR58oyJ8rAxuDTsnV7jrSo+JjyzJIGnEwn2Q5G";
    const OTHER: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFltGNimnG9OrRLdAz6SQb+kp8jvmSln39tWplxxCg4i";
    const MESSAGE: &[u8] = b"session exchange hash";
    const SIGNATURE: &str = "3168274b9cc0663fe51fe8fbab3a87bf017754f5f1684461d9653ce4b66f6fa9\
                             6e82951385b78eba9e759e9c0a87bc1b3a12d2700479b722732f7435f8a9d703";

    fn key(s: &str) -> PublicKey {
        PublicKey::from_openssh(s.trim()).unwrap()
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:22".parse().unwrap()
    }

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn blob(format: &str, sig: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        put_string(&mut buf, format.as_bytes()).unwrap();
        put_string(&mut buf, sig).unwrap();
        buf
    }

    #[test]
    fn test_insecure_accepts_anything() {
        let cb = insecure_ignore_host_key();
        assert!(cb("h", remote(), &key(HOST_A)).is_ok());
    }

    #[test]
    fn test_fixed_host_key() {
        let cb = fixed_host_key(key(HOST_A));
        assert!(cb("h", remote(), &key(HOST_A)).is_ok());
        assert!(matches!(
            cb("h", remote(), &key(HOST_B)),
            Err(HostKeyError::Mismatch { host }) if host == "h"
        ));

        let none = FixedHostKey::new(None);
        assert!(matches!(
            none.check("h", remote(), &key(HOST_A)),
            Err(HostKeyError::NoFixedKey)
        ));
    }

    #[test]
    fn test_signature_verifies() {
        let blob = blob("ssh-ed25519", &unhex(SIGNATURE));
        verify_host_key_signature(&key(SIGNER), MESSAGE, &blob).unwrap();
    }

    #[test]
    fn test_signature_rejections() {
        let sig = unhex(SIGNATURE);

        // wrong key
        let good = blob("ssh-ed25519", &sig);
        assert!(matches!(
            verify_host_key_signature(&key(OTHER), MESSAGE, &good),
            Err(HostKeyError::SignatureInvalid(_))
        ));

        // wrong data
        assert!(verify_host_key_signature(&key(SIGNER), b"other", &good).is_err());

        // trailing bytes
        let mut long = good.clone();
        long.extend_from_slice(b"x");
        assert!(matches!(
            verify_host_key_signature(&key(SIGNER), MESSAGE, &long),
            Err(HostKeyError::SignatureParse)
        ));

        // truncated
        assert!(matches!(
            verify_host_key_signature(&key(SIGNER), MESSAGE, &good[..good.len() - 1]),
            Err(HostKeyError::SignatureParse)
        ));

        // unknown format
        let odd = blob("no-such-alg", &sig);
        assert!(verify_host_key_signature(&key(SIGNER), MESSAGE, &odd).is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:2222", 22), ("example.com", 2222));
        assert_eq!(split_host_port("example.com", 22), ("example.com", 22));
        assert_eq!(split_host_port("[::1]:2200", 22), ("::1", 2200));
        assert_eq!(split_host_port("::1", 22), ("::1", 22));
    }

    fn scratch_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ferrissh-mux-{}-{}",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_known_hosts_strict_rejects_unknown() {
        let path = scratch_file("strict");
        let cb = known_hosts(KnownHostsPolicy::Strict, Some(path));
        assert!(matches!(
            cb("example.com:2222", remote(), &key(HOST_A)),
            Err(HostKeyError::Unknown { port: 2222, .. })
        ));
    }

    #[test]
    fn test_known_hosts_accept_new_then_detect_change() {
        let path = scratch_file("accept-new");
        let cb = known_hosts(KnownHostsPolicy::AcceptNew, Some(path.clone()));
        cb("example.com:2222", remote(), &key(HOST_A)).unwrap();
        cb("example.com:2222", remote(), &key(HOST_A)).unwrap();

        let strict = known_hosts(KnownHostsPolicy::Strict, Some(path.clone()));
        strict("example.com:2222", remote(), &key(HOST_A)).unwrap();
        assert!(matches!(
            strict("example.com:2222", remote(), &key(HOST_B)),
            Err(HostKeyError::Changed { .. })
        ));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_known_hosts_disabled() {
        let cb = known_hosts(KnownHostsPolicy::Disabled, Some(scratch_file("disabled")));
        assert!(cb("h", remote(), &key(HOST_B)).is_ok());
    }
}
