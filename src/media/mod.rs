pub mod decoder;

pub use decoder::{FrameDecoder, VideoCodec};
