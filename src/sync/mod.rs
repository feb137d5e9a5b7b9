//! Synchronization primitives shared by the worker pool and the RT output
//! handoff.

pub mod barrier;
pub mod double_buffer;
pub mod rt_buffer;

pub use barrier::{Barrier, WaitResult};
pub use double_buffer::PreprocessedDoubleBuffer;
pub use rt_buffer::{AudioSink, RtOutputBuffer};
