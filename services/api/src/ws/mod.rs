//! The WebSocket session layer: wire protocol, per-connection state, the
//! streaming turn pipeline, and the handler that ties them together.

pub mod cancel;
pub mod conn;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod sink;

pub use session::ws_handler;
