//! Controller-worker bridge: wire frames, line codec, process transport.

pub mod codec;
pub mod protocol;
pub mod transport;

pub use codec::{DecodeError, ExceptionPayload, FrameCodec};
pub use protocol::{ControlFrame, Frame};
