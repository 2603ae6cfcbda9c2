//! Stream multiplexing (smux wire format)
//!
//! Carries many logical byte streams over one underlying connection.
//! The server side wraps accepted TLS connections in a [`Session`] and
//! hands each accepted sub-stream to a protocol handler; the agent side
//! opens sub-streams through a lazily dialed [`MuxConn`], optionally a
//! whole [`MuxPool`] of them.

mod conn;
mod frame;
mod pool;
mod session;
mod stream;

pub use conn::{DialFn, MuxConn};
pub use pool::MuxPool;
pub use session::{MuxConfig, Session};
pub use stream::MuxStream;
