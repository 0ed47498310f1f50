pub mod processor;
pub mod registry;

pub use processor::{ProcessorContext, StreamProcessor};
pub use registry::{StreamHandle, StreamRegistry, StreamStats};
