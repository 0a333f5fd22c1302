//! Channel layer: byte buffers and open channels.
//!
//! Every channel owns a stdout and a stderr [`Buffer`] fed by a pump task,
//! so a slow consumer never blocks the connection's reader.

mod buffer;
mod session;
pub(crate) mod stream;

pub use buffer::{Buffer, BufferError};
pub use session::{Output, Session};
pub use stream::ChannelStream;
