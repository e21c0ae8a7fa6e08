use super::{BackupBufferFactory, FrameItem, FrameStream, VideoBuffer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Consecutive non-timeout frames the monitor must observe before
/// switching back to the primary stream.
const RECOVERY_FRAMES: u32 = 3;

/// A buffer that falls back to a lazily-created backup buffer when the
/// primary buffer times out.
///
/// While the backup is active a monitor task keeps pulling the primary
/// stream; once it sees [`RECOVERY_FRAMES`] consecutive frames the backup
/// is torn down and subscribers return to the primary. If the primary
/// terminates, the failsafe terminates with it.
pub struct FailsafeBuffer {
    shared: Arc<FailsafeShared>,
}

struct FailsafeShared {
    primary: Arc<dyn VideoBuffer>,
    backup_factory: BackupBufferFactory,
    state: Mutex<FailsafeState>,
}

struct FailsafeState {
    backup: Option<Arc<dyn VideoBuffer>>,
    monitor: Option<JoinHandle<()>>,
    closed: bool,
}

impl FailsafeBuffer {
    pub fn new(primary: Arc<dyn VideoBuffer>, backup_factory: BackupBufferFactory) -> Self {
        Self {
            shared: Arc::new(FailsafeShared {
                primary,
                backup_factory,
                state: Mutex::new(FailsafeState {
                    backup: None,
                    monitor: None,
                    closed: false,
                }),
            }),
        }
    }
}

impl FailsafeShared {
    fn current_backup(&self) -> Option<Arc<dyn VideoBuffer>> {
        self.state.lock().backup.clone()
    }

    /// Create the backup and start the recovery monitor. Concurrent
    /// subscribers observing a timeout at the same time construct exactly
    /// one backup.
    fn switch_to_backup(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closed || state.backup.is_some() {
            return;
        }
        info!("switching to backup stream");
        state.backup = Some((self.backup_factory)());
        let shared = Arc::clone(self);
        state.monitor = Some(tokio::spawn(async move {
            shared.monitor_primary().await;
        }));
    }

    async fn monitor_primary(self: Arc<Self>) {
        let mut stream = self.primary.stream();
        let mut consecutive = 0u32;
        loop {
            match stream.next().await {
                Some(FrameItem::Frame(_)) => {
                    consecutive += 1;
                    if consecutive >= RECOVERY_FRAMES {
                        info!("switching to primary stream");
                        break;
                    }
                }
                Some(FrameItem::Timeout) => consecutive = 0,
                // primary terminated: tear the backup down and quit; the
                // failsafe ends with the primary
                None => {
                    debug!("primary stream ended while on backup");
                    break;
                }
            }
        }

        let backup = {
            let mut state = self.state.lock();
            state.monitor = None;
            state.backup.take()
        };
        if let Some(backup) = backup {
            backup.close();
        }
    }
}

impl VideoBuffer for FailsafeBuffer {
    fn stream(&self) -> Box<dyn FrameStream> {
        Box::new(FailsafeStream {
            inner: self.shared.primary.stream(),
            on_backup: None,
            shared: Arc::clone(&self.shared),
        })
    }

    fn close(&self) {
        let (backup, monitor) = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            (state.backup.take(), state.monitor.take())
        };
        self.shared.primary.close();
        if let Some(backup) = backup {
            backup.close();
        }
        if let Some(monitor) = monitor {
            monitor.abort();
        }
    }
}

struct FailsafeStream {
    inner: Box<dyn FrameStream>,
    /// The backup buffer this stream is currently subscribed to, if any.
    on_backup: Option<Arc<dyn VideoBuffer>>,
    shared: Arc<FailsafeShared>,
}

#[async_trait]
impl FrameStream for FailsafeStream {
    async fn next(&mut self) -> Option<FrameItem> {
        loop {
            let subscribed = self.on_backup.clone();
            let active = self.shared.current_backup();

            match (subscribed, active) {
                // primary mode, and nobody has switched away
                (None, None) => {
                    return match self.inner.next().await {
                        Some(FrameItem::Timeout) => {
                            self.shared.switch_to_backup();
                            // still yield the timeout so the caller may
                            // substitute a placeholder
                            Some(FrameItem::Timeout)
                        }
                        other => other,
                    };
                }
                // a backup is active (created here or by another
                // subscriber): follow it
                (None, Some(backup)) => {
                    self.inner = backup.stream();
                    self.on_backup = Some(backup);
                }
                // on the backup we are subscribed to
                (Some(mine), Some(active)) if Arc::ptr_eq(&mine, &active) => {
                    match self.inner.next().await {
                        Some(item) => return Some(item),
                        None => {
                            if self.shared.current_backup().is_none() {
                                // the monitor switched back to primary
                                self.inner = self.shared.primary.stream();
                                self.on_backup = None;
                            } else {
                                // the backup itself terminated
                                return None;
                            }
                        }
                    }
                }
                // the backup was replaced or cleared under us
                (Some(_), Some(other)) => {
                    self.inner = other.stream();
                    self.on_backup = Some(other);
                }
                (Some(_), None) => {
                    self.inner = self.shared.primary.stream();
                    self.on_backup = None;
                }
            }
        }
    }
}
