//! Core types shared by every layer: the boxed stream, addresses,
//! the bidirectional copy engine and the accept-loop backoff policy.

pub mod accept;
pub mod address;
pub mod copy;
pub mod stream;

pub use address::{ensure_port, strip_port, Address};
pub use copy::relay;
pub use stream::{IntoStream, PrependStream, Stream};

pub use crate::error::{Error, Result};
