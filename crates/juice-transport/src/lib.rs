pub mod frame;
pub mod framer;
pub mod pipe;

pub use frame::{Frame, FrameType};
pub use framer::Framer;
pub use pipe::{memory_pipe, MemoryPipe, MessagePipe};
