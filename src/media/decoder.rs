//! Per-stream video decoding.
//!
//! Depacketized codec frames go into an `appsrc`, decoded RGB frames come
//! out of an `appsink` and land in a `watch` channel. The watch channel is
//! the pipeline's back-pressure valve: a slow processor only ever sees the
//! most recent frame, older ones are overwritten instead of queued.

use std::sync::Arc;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use image::RgbImage;
use log::{debug, error, warn};
use tokio::sync::watch;

use crate::error::Error;

/// Inbound track codecs we can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Vp8,
}

impl VideoCodec {
    /// Map an RTP codec capability mime type to a decoder, if supported.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "video/h264" => Some(VideoCodec::H264),
            "video/vp8" => Some(VideoCodec::Vp8),
            _ => None,
        }
    }

    fn pipeline_description(&self) -> &'static str {
        match self {
            VideoCodec::H264 => {
                "appsrc name=src is-live=true do-timestamp=true format=time \
                 ! h264parse ! avdec_h264 ! videoconvert \
                 ! video/x-raw,format=RGB ! appsink name=sink sync=false"
            }
            VideoCodec::Vp8 => {
                "appsrc name=src is-live=true do-timestamp=true format=time \
                 ! vp8dec ! videoconvert \
                 ! video/x-raw,format=RGB ! appsink name=sink sync=false"
            }
        }
    }

    fn src_caps(&self) -> gst::Caps {
        match self {
            VideoCodec::H264 => gst::Caps::builder("video/x-h264")
                .field("stream-format", "byte-stream")
                .field("alignment", "au")
                .build(),
            VideoCodec::Vp8 => gst::Caps::builder("video/x-vp8").build(),
        }
    }
}

/// One decoding pipeline bound to one inbound track.
pub struct FrameDecoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
}

impl FrameDecoder {
    /// Build and start a pipeline for the codec. Decoded frames are
    /// published through `frames`.
    pub fn new(
        codec: VideoCodec,
        frames: watch::Sender<Option<Arc<RgbImage>>>,
    ) -> Result<Self, Error> {
        let pipeline = gst::parse::launch(codec.pipeline_description())
            .map_err(|e| Error::Transport(format!("decode pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::Transport("decode pipeline is not a pipeline".to_string()))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| Error::Transport("appsrc element missing".to_string()))?;
        appsrc.set_caps(Some(&codec.src_caps()));

        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| Error::Transport("appsink element missing".to_string()))?;
        appsink.set_caps(Some(
            &gst::Caps::builder("video/x-raw").field("format", "RGB").build(),
        ));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    match sample_to_image(&sample) {
                        Some(image) => {
                            // Last frame wins; nobody queues behind a slow
                            // consumer.
                            frames.send_replace(Some(Arc::new(image)));
                            Ok(gst::FlowSuccess::Ok)
                        }
                        None => {
                            warn!("dropping undecodable sample");
                            Ok(gst::FlowSuccess::Ok)
                        }
                    }
                })
                .eos(|_| debug!("decode pipeline reached EOS"))
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::Transport(format!("start decode pipeline: {}", e)))?;

        Ok(Self { pipeline, appsrc })
    }

    /// Feed one depacketized codec frame into the pipeline.
    pub fn push(&self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        let buffer = gst::Buffer::from_slice(data.to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| Error::Transport(format!("push buffer: {:?}", e)))
    }

    /// Stop the pipeline and release its resources.
    pub fn close(&self) {
        let _ = self.appsrc.end_of_stream();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            error!("failed to stop decode pipeline: {:?}", e);
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_image(sample: &gst::Sample) -> Option<RgbImage> {
    let caps = sample.caps()?;
    let structure = caps.structure(0)?;
    let width = structure.get::<i32>("width").ok()? as u32;
    let height = structure.get::<i32>("height").ok()? as u32;
    if width == 0 || height == 0 {
        return None;
    }

    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    let data = map.as_slice();

    let row_bytes = (width * 3) as usize;
    if data.len() == row_bytes * height as usize {
        return RgbImage::from_raw(width, height, data.to_vec());
    }

    // Rows can carry alignment padding; copy them out tightly.
    let stride = data.len() / height as usize;
    if stride < row_bytes {
        return None;
    }
    let mut tight = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        tight.extend_from_slice(&data[start..start + row_bytes]);
    }
    RgbImage::from_raw(width, height, tight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_mime_mapping() {
        assert_eq!(VideoCodec::from_mime("video/H264"), Some(VideoCodec::H264));
        assert_eq!(VideoCodec::from_mime("video/VP8"), Some(VideoCodec::Vp8));
        assert_eq!(VideoCodec::from_mime("video/VP9"), None);
        assert_eq!(VideoCodec::from_mime("audio/opus"), None);
    }
}
