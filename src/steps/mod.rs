//! Step Implementations
//!
//! Ready-made steps for pipelines:
//!
//! - [`code`]: plain functions (`apply`, `try_apply`, `supply`, `consume`, `run`)
//! - [`socket`]: TCP send and receive over the scope's event loop
//! - [`buffer`]: the byte buffer socket steps operate on

pub mod buffer;
pub mod code;
pub mod socket;

pub use buffer::ByteBuffer;
pub use code::{apply, consume, run, supply, try_apply, CodeExecution};
pub use socket::{receive_from, send_to, SocketReceive, SocketSend};

pub use crate::execution::channel::Endpoint;
