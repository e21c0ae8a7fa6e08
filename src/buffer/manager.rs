use super::{build_buffer, FrameItem, FrameStream, VideoBuffer};
use crate::config::{BufferConfig, RelayConfig};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Builds the active buffer from its configuration record.
pub type BufferBuilder = Box<dyn Fn(&BufferConfig) -> Result<Arc<dyn VideoBuffer>> + Send + Sync>;

/// Reference-counts streaming clients and owns the single active buffer.
///
/// The upstream is opened when the first client arrives. When the last
/// client leaves, a stop timer keeps the upstream alive for
/// `stop_stream_holdoff`, so a quick reconnect reuses it; the timer is
/// cancelled by the next arrival. When the buffer configuration changes,
/// the active buffer is replaced immediately and attached subscribers are
/// moved over transparently.
pub struct BufferManager {
    state: Mutex<ManagerState>,
    builder: BufferBuilder,
}

struct ManagerState {
    config: BufferConfig,
    holdoff: Duration,
    n_clients: usize,
    active: Option<ActiveBuffer>,
    /// Bumped on every buffer start, so subscriber iterators can tell a
    /// replacement from a plain shutdown.
    epoch: u64,
    stop_task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct ActiveBuffer {
    buffer: Arc<dyn VideoBuffer>,
    epoch: u64,
}

impl BufferManager {
    pub fn new(config: &RelayConfig) -> Arc<Self> {
        Self::with_builder(config, Box::new(|config| build_buffer(config)))
    }

    /// Like [`new`](Self::new), with an injectable buffer builder.
    pub fn with_builder(config: &RelayConfig, builder: BufferBuilder) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState {
                config: config.buffer.clone(),
                holdoff: config.stop_stream_holdoff,
                n_clients: 0,
                active: None,
                epoch: 0,
                stop_task: None,
            }),
            builder,
        })
    }

    pub fn n_clients(&self) -> usize {
        self.state.lock().n_clients
    }

    /// Subscribe a client, starting the upstream capture if necessary. The
    /// slot is released when the returned stream is dropped.
    pub fn acquire(self: &Arc<Self>) -> ManagedStream {
        let mut state = self.state.lock();
        if state.n_clients == 0 {
            if let Some(task) = state.stop_task.take() {
                task.abort();
            }
            if state.active.is_none() {
                Self::start_buffer(&mut state, &self.builder);
            }
        }
        state.n_clients += 1;
        debug!("buffer manager: {} clients", state.n_clients);

        let subscription = state.active.as_ref().map(|active| Subscription {
            stream: active.buffer.stream(),
            epoch: active.epoch,
        });
        ManagedStream {
            manager: Arc::clone(self),
            subscription,
        }
    }

    fn start_buffer(state: &mut ManagerState, builder: &BufferBuilder) {
        state.epoch += 1;
        match builder(&state.config) {
            Ok(buffer) => {
                info!("started stream capture");
                state.active = Some(ActiveBuffer {
                    buffer,
                    epoch: state.epoch,
                });
            }
            Err(e) => {
                error!("failed to start stream capture: {e}");
                state.active = None;
            }
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.n_clients = state.n_clients.saturating_sub(1);
        debug!("buffer manager: {} clients", state.n_clients);
        if state.n_clients == 0 && state.active.is_some() {
            let holdoff = state.holdoff;
            Self::stop_buffer(self, &mut state, holdoff);
        }
    }

    fn stop_buffer(manager: &Arc<Self>, state: &mut ManagerState, holdoff: Duration) {
        if let Some(task) = state.stop_task.take() {
            task.abort();
        }
        if holdoff.is_zero() {
            if let Some(active) = state.active.take() {
                info!("stopped stream capture");
                active.buffer.close();
            }
            return;
        }
        let weak = Arc::downgrade(manager);
        state.stop_task = Some(tokio::spawn(async move {
            tokio::time::sleep(holdoff).await;
            if let Some(manager) = weak.upgrade() {
                let mut state = manager.state.lock();
                if state.n_clients == 0 {
                    if let Some(active) = state.active.take() {
                        info!("stopped stream capture");
                        active.buffer.close();
                    }
                }
                state.stop_task = None;
            }
        }));
    }

    /// Apply a configuration snapshot: adopt the new holdoff and, when the
    /// pipeline configuration changed, replace the active buffer (any
    /// attached subscribers follow onto the replacement).
    pub fn apply_config(self: &Arc<Self>, config: &RelayConfig) {
        let mut state = self.state.lock();
        state.holdoff = config.stop_stream_holdoff;
        if state.config == config.buffer {
            return;
        }
        info!("stream configuration changed");
        state.config = config.buffer.clone();
        if state.active.is_some() {
            Self::stop_buffer(self, &mut state, Duration::ZERO);
            if state.n_clients > 0 {
                Self::start_buffer(&mut state, &self.builder);
            }
        }
    }
}

struct Subscription {
    stream: Box<dyn FrameStream>,
    epoch: u64,
}

/// A client's view of the manager's active buffer.
///
/// When the buffer it is subscribed to terminates because the manager
/// replaced it, the stream transparently resubscribes to the replacement;
/// otherwise it terminates. Dropping the stream releases the client slot.
pub struct ManagedStream {
    manager: Arc<BufferManager>,
    subscription: Option<Subscription>,
}

impl ManagedStream {
    pub async fn next(&mut self) -> Option<FrameItem> {
        loop {
            let subscription = self.subscription.as_mut()?;
            if let Some(item) = subscription.stream.next().await {
                return Some(item);
            }

            let current_epoch = subscription.epoch;
            let replacement = {
                let state = self.manager.state.lock();
                match &state.active {
                    Some(active) if active.epoch != current_epoch => Some(Subscription {
                        stream: active.buffer.stream(),
                        epoch: active.epoch,
                    }),
                    _ => None,
                }
            };
            match replacement {
                Some(subscription) => self.subscription = Some(subscription),
                None => {
                    self.subscription = None;
                    return None;
                }
            }
        }
    }
}

impl Drop for ManagedStream {
    fn drop(&mut self) {
        self.manager.release();
    }
}
