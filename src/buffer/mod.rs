mod failsafe;
mod frame_buffer;
mod manager;
mod static_images;

pub use failsafe::FailsafeBuffer;
pub use frame_buffer::FrameBuffer;
pub use manager::{BufferBuilder, BufferManager, ManagedStream};
pub use static_images::StaticImageBuffer;

use crate::config::{BufferConfig, WebcamBufferConfig};
use crate::error::{RelayError, Result};
use crate::frame::Frame;
use crate::source::{WebcamStillSource, WebcamVideoSource};
use async_trait::async_trait;
use std::sync::Arc;

/// One item pulled from a buffered stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameItem {
    Frame(Frame),
    /// No frame arrived within the configured window; clients substitute
    /// the placeholder image.
    Timeout,
}

/// A lazy per-subscriber sequence of frames.
#[async_trait]
pub trait FrameStream: Send {
    /// The next item, or `None` when the stream is finished.
    async fn next(&mut self) -> Option<FrameItem>;
}

/// A buffered source of video frames with independent subscribers.
pub trait VideoBuffer: Send + Sync {
    /// Subscribe to the buffer. The first item is the most recently
    /// buffered frame, or the next one acquired if the buffer is empty.
    fn stream(&self) -> Box<dyn FrameStream>;

    /// Shut the buffer down, releasing every waiting subscriber.
    /// Idempotent.
    fn close(&self);
}

/// Produces the backup buffer of a [`FailsafeBuffer`], on first need.
pub type BackupBufferFactory = Box<dyn Fn() -> Arc<dyn VideoBuffer> + Send + Sync>;

/// Build the frame pipeline described by a configuration record.
///
/// A `static.images` configuration yields a [`StaticImageBuffer`]. A webcam
/// configuration yields the capture buffer for its streaming endpoint, for
/// its still endpoint, or a [`FailsafeBuffer`] combining both.
pub fn build_buffer(config: &BufferConfig) -> Result<Arc<dyn VideoBuffer>> {
    match config {
        BufferConfig::Static(config) => Ok(Arc::new(StaticImageBuffer::from_config(config)?)),
        BufferConfig::Webcam(config) => build_webcam_buffer(config),
    }
}

fn build_webcam_buffer(config: &WebcamBufferConfig) -> Result<Arc<dyn VideoBuffer>> {
    let video = config.stream.as_ref().map(|endpoint| {
        let source = WebcamVideoSource::new(endpoint.clone());
        Arc::new(FrameBuffer::new(
            Box::new(source),
            config.frame_timeout,
            config.buffer_size,
        )) as Arc<dyn VideoBuffer>
    });

    let still_factory: Option<BackupBufferFactory> = config.still.as_ref().map(|endpoint| {
        let endpoint = endpoint.clone();
        let frame_timeout = config.frame_timeout;
        let buffer_size = config.buffer_size;
        let factory: BackupBufferFactory = Box::new(move || {
            let source = WebcamStillSource::new(endpoint.clone());
            Arc::new(FrameBuffer::new(
                Box::new(source),
                frame_timeout,
                buffer_size,
            )) as Arc<dyn VideoBuffer>
        });
        factory
    });

    match (video, still_factory) {
        (Some(video), Some(still_factory)) => {
            Ok(Arc::new(FailsafeBuffer::new(video, still_factory)))
        }
        (Some(video), None) => Ok(video),
        (None, Some(still_factory)) => Ok(still_factory()),
        (None, None) => Err(RelayError::NotConfigured),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::source::{FrameSource, SourceItem};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Script step for a [`ScriptedSource`].
    pub(crate) enum Step {
        Frame(Frame),
        Timeout,
        Wait(Duration),
        End,
    }

    pub(crate) fn frame(data: &str) -> Frame {
        Frame::new(data.as_bytes().to_vec(), "image/jpeg")
    }

    /// A frame source that replays a fixed script, for driving buffers in
    /// tests without a network.
    pub(crate) struct ScriptedSource {
        steps: VecDeque<Step>,
        closed: bool,
    }

    impl ScriptedSource {
        pub(crate) fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                closed: false,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> SourceItem {
            loop {
                if self.closed {
                    return SourceItem::End;
                }
                match self.steps.pop_front() {
                    Some(Step::Wait(duration)) => std::thread::sleep(duration),
                    Some(Step::Frame(frame)) => return SourceItem::Frame(frame),
                    Some(Step::Timeout) => return SourceItem::Timeout,
                    Some(Step::End) | None => return SourceItem::End,
                }
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn describe(&self) -> String {
            "scripted source".to_string()
        }
    }

    /// A buffer that emits one fixed frame at a steady cadence until
    /// closed, entirely on the cooperative scheduler.
    pub(crate) struct StubBuffer {
        frame: Frame,
        interval: Duration,
        closed: Arc<AtomicBool>,
    }

    impl StubBuffer {
        pub(crate) fn new(frame: Frame, interval: Duration) -> Self {
            Self {
                frame,
                interval,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl VideoBuffer for StubBuffer {
        fn stream(&self) -> Box<dyn FrameStream> {
            Box::new(StubStream {
                frame: self.frame.clone(),
                interval: self.interval,
                closed: Arc::clone(&self.closed),
            })
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct StubStream {
        frame: Frame,
        interval: Duration,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameStream for StubStream {
        async fn next(&mut self) -> Option<FrameItem> {
            tokio::time::sleep(self.interval).await;
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            Some(FrameItem::Frame(self.frame.clone()))
        }
    }

    /// Script step for a [`ScriptedBuffer`] stream.
    #[derive(Clone)]
    pub(crate) enum StreamStep {
        Item(FrameItem),
        Wait(Duration),
    }

    /// A buffer whose every subscriber replays a fixed item script, for
    /// driving the HTTP layer in tests.
    pub(crate) struct ScriptedBuffer {
        steps: Vec<StreamStep>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedBuffer {
        pub(crate) fn new(steps: Vec<StreamStep>) -> Self {
            Self {
                steps,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl VideoBuffer for ScriptedBuffer {
        fn stream(&self) -> Box<dyn FrameStream> {
            Box::new(ScriptedBufferStream {
                steps: self.steps.clone().into(),
                closed: Arc::clone(&self.closed),
            })
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedBufferStream {
        steps: VecDeque<StreamStep>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameStream for ScriptedBufferStream {
        async fn next(&mut self) -> Option<FrameItem> {
            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
                match self.steps.pop_front() {
                    Some(StreamStep::Wait(duration)) => tokio::time::sleep(duration).await,
                    Some(StreamStep::Item(item)) => return Some(item),
                    None => return None,
                }
            }
        }
    }
}
