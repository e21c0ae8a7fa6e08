use super::{FrameItem, FrameStream, VideoBuffer};
use crate::config::StaticSourceConfig;
use crate::error::{RelayError, Result};
use crate::frame::Frame;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A video buffer over a fixed set of image files. For exercising the
/// relay without a live camera.
///
/// Frames are paced against wall-clock time from the moment the buffer was
/// created, so every subscriber sees the same "live" position; the set
/// either loops or the stream ends after the last image.
pub struct StaticImageBuffer {
    frames: Arc<Vec<Frame>>,
    loop_images: bool,
    frame_rate: f64,
    started: Instant,
    closed: Arc<AtomicBool>,
}

impl StaticImageBuffer {
    pub fn new(frames: Vec<Frame>, loop_images: bool, frame_rate: f64) -> Self {
        Self {
            frames: Arc::new(frames),
            loop_images,
            frame_rate,
            started: Instant::now(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load the files matched by the configured glob, in sorted order.
    pub fn from_config(config: &StaticSourceConfig) -> Result<Self> {
        let mut paths: Vec<PathBuf> = glob::glob(&config.images)
            .map_err(|e| RelayError::InvalidSetting {
                key: "static.images".to_string(),
                reason: e.to_string(),
            })?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();

        let frames = paths
            .iter()
            .map(Frame::from_file)
            .collect::<Result<Vec<_>>>()?;
        debug!("loaded {} static frames from {}", frames.len(), config.images);

        Ok(Self::new(frames, config.loop_images, config.frame_rate))
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl VideoBuffer for StaticImageBuffer {
    fn stream(&self) -> Box<dyn FrameStream> {
        Box::new(StaticImageStream {
            frames: Arc::clone(&self.frames),
            loop_images: self.loop_images,
            frame_rate: self.frame_rate,
            started: self.started,
            closed: Arc::clone(&self.closed),
            last: None,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct StaticImageStream {
    frames: Arc<Vec<Frame>>,
    loop_images: bool,
    frame_rate: f64,
    started: Instant,
    closed: Arc<AtomicBool>,
    last: Option<u64>,
}

#[async_trait]
impl FrameStream for StaticImageStream {
    async fn next(&mut self) -> Option<FrameItem> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let position = (self.frame_rate * self.started.elapsed().as_secs_f64()).max(0.0);
        let mut index = position as u64;
        if Some(index) == self.last {
            // already served this slot; sleep until the next one opens
            let wait = ((index + 1) as f64 - position) / self.frame_rate;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            index += 1;
        }
        self.last = Some(index);

        let count = self.frames.len() as u64;
        let index = if self.loop_images {
            index % count.max(1)
        } else {
            index
        };
        if self.closed.load(Ordering::SeqCst) || index >= count {
            return None;
        }
        Some(FrameItem::Frame(self.frames[index as usize].clone()))
    }
}
