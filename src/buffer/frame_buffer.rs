use super::{FrameItem, FrameStream, VideoBuffer};
use crate::frame::Frame;
use crate::source::{FrameSource, SourceItem};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

struct RingState {
    ring: VecDeque<Frame>,
    /// Total number of frames ever appended. The oldest retained frame has
    /// global index `length - ring.len()`.
    length: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<RingState>,
    /// Cross-scheduler wakeup: the capture thread signals, cooperative
    /// subscribers wait. `notify_waiters` never blocks the notifier and
    /// wakes every registered waiter; coalesced signals are fine because
    /// waiters re-check the ring under the mutex.
    notify: Notify,
    buffer_size: usize,
    frame_timeout: Duration,
}

/// Captures frames from a source on a dedicated OS thread and broadcasts
/// them to any number of cooperative subscribers.
///
/// The source performs blocking network reads, so it gets its own thread;
/// the ring is the only structure shared across that boundary. Subscribers
/// track a monotone cursor into the append counter: a subscriber that falls
/// behind the ring is snapped forward to the oldest retained frame.
pub struct FrameBuffer {
    shared: Arc<Shared>,
    name: String,
    producer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FrameBuffer {
    pub fn new(source: Box<dyn FrameSource>, frame_timeout: Duration, buffer_size: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(RingState {
                ring: VecDeque::with_capacity(buffer_size),
                length: 0,
                closed: false,
            }),
            notify: Notify::new(),
            buffer_size,
            frame_timeout,
        });

        let name = source.describe();
        let worker = Arc::clone(&shared);
        let producer = std::thread::spawn(move || Self::run(source, worker));

        Self {
            shared,
            name,
            producer: Mutex::new(Some(producer)),
        }
    }

    fn run(mut source: Box<dyn FrameSource>, shared: Arc<Shared>) {
        debug!("capture thread starting: {}", source.describe());
        loop {
            if shared.state.lock().closed {
                break;
            }
            match source.next_frame() {
                SourceItem::Frame(frame) => {
                    let mut state = shared.state.lock();
                    if state.closed {
                        break;
                    }
                    if state.ring.len() == shared.buffer_size {
                        state.ring.pop_front();
                    }
                    state.ring.push_back(frame);
                    state.length += 1;
                    trace!("appended frame {}", state.length);
                    drop(state);
                    shared.notify.notify_waiters();
                }
                // the source already applied its backoff; just retry
                SourceItem::Timeout => continue,
                SourceItem::End => {
                    shared.state.lock().closed = true;
                    shared.notify.notify_waiters();
                    break;
                }
            }
        }
        source.close();
        debug!("capture thread terminating: {}", source.describe());
    }

    /// True while the capture thread is still running.
    pub fn is_alive(&self) -> bool {
        self.producer
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl VideoBuffer for FrameBuffer {
    fn stream(&self) -> Box<dyn FrameStream> {
        let cursor = self.shared.state.lock().length.saturating_sub(1);
        Box::new(FrameBufferStream {
            shared: Arc::clone(&self.shared),
            cursor,
        })
    }

    fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.closed {
                debug!("closing frame buffer: {}", self.name);
                state.closed = true;
            }
        }
        self.shared.notify.notify_waiters();
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

struct FrameBufferStream {
    shared: Arc<Shared>,
    /// Position in the producer's global index space. Invariant:
    /// `cursor <= length`.
    cursor: u64,
}

#[async_trait]
impl FrameStream for FrameBufferStream {
    async fn next(&mut self) -> Option<FrameItem> {
        let deadline = tokio::time::Instant::now() + self.shared.frame_timeout;
        loop {
            // register for wakeup before checking the predicate, so an
            // append between the check and the wait is never missed
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.shared.state.lock();
                if self.cursor < state.length {
                    let oldest = state.length - state.ring.len() as u64;
                    if self.cursor < oldest {
                        debug!("dropped {} frames", oldest - self.cursor);
                        self.cursor = oldest;
                    }
                    let frame = state.ring[(self.cursor - oldest) as usize].clone();
                    self.cursor += 1;
                    return Some(FrameItem::Frame(frame));
                }
                if state.closed {
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // the cursor stays put; the next frame is not skipped
                return Some(FrameItem::Timeout);
            }
        }
    }
}
