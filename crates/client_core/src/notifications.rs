use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{
    runtime::{Handle, TryCurrentError},
    sync::broadcast,
    task::JoinHandle,
};
use tracing::debug;

use crate::settings::DEFAULT_NOTIFICATION_TIMEOUT_MS;

pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration =
    Duration::from_millis(DEFAULT_NOTIFICATION_TIMEOUT_MS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(u64);

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationKind {
    #[default]
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub message: String,
    pub kind: NotificationKind,
    /// Zero means the notification stays until dismissed.
    pub timeout: Duration,
}

impl Notification {
    pub fn is_persistent(&self) -> bool {
        self.timeout.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissReason {
    Manual,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Shown(Notification),
    Dismissed {
        id: NotificationId,
        reason: DismissReason,
    },
}

struct Entry {
    notification: Notification,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    entries: Vec<Entry>,
    closed: bool,
}

pub struct NotificationQueue {
    runtime: Handle,
    default_timeout: Duration,
    state: Mutex<QueueState>,
    events: broadcast::Sender<NotificationEvent>,
}

impl NotificationQueue {
    pub fn new(runtime: Handle, default_timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            runtime,
            default_timeout,
            state: Mutex::new(QueueState::default()),
            events,
        })
    }

    pub fn for_current_runtime(default_timeout: Duration) -> Result<Arc<Self>, TryCurrentError> {
        Ok(Self::new(Handle::try_current()?, default_timeout))
    }

    pub fn notify(self: &Arc<Self>, message: impl Into<String>, kind: NotificationKind) -> NotificationId {
        self.notify_with_timeout(message, kind, self.default_timeout)
    }

    pub fn success(self: &Arc<Self>, message: impl Into<String>) -> NotificationId {
        self.notify(message, NotificationKind::Success)
    }

    pub fn error(self: &Arc<Self>, message: impl Into<String>) -> NotificationId {
        self.notify(message, NotificationKind::Error)
    }

    pub fn notify_with_timeout(
        self: &Arc<Self>,
        message: impl Into<String>,
        kind: NotificationKind,
        timeout: Duration,
    ) -> NotificationId {
        let mut state = self.state();
        state.next_id += 1;
        let id = NotificationId(state.next_id);
        let notification = Notification {
            id,
            message: message.into(),
            kind,
            timeout,
        };

        if state.closed {
            debug!(notification_id = %id, "notification queue closed; dropping notification");
            return id;
        }

        let timer = (!timeout.is_zero()).then(|| {
            let queue = Arc::downgrade(self);
            self.runtime.spawn(expire_after(queue, id, timeout))
        });
        state.entries.push(Entry {
            notification: notification.clone(),
            timer,
        });
        drop(state);

        debug!(notification_id = %id, ?kind, ?timeout, "notification shown");
        let _ = self.events.send(NotificationEvent::Shown(notification));
        id
    }

    /// Removes the notification and cancels its timer. Unknown ids are ignored.
    pub fn dismiss(&self, id: NotificationId) {
        if let Some(entry) = self.remove(id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            debug!(notification_id = %id, "notification dismissed");
            let _ = self.events.send(NotificationEvent::Dismissed {
                id,
                reason: DismissReason::Manual,
            });
        }
    }

    pub fn active(&self) -> Vec<Notification> {
        self.state()
            .entries
            .iter()
            .map(|entry| entry.notification.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    /// Cancels every pending timer and clears the queue. Later `notify` calls
    /// are dropped.
    pub fn shutdown(&self) {
        let entries = {
            let mut state = self.state();
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        for entry in &entries {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }
        debug!(cancelled = entries.len(), "notification queue shut down");
    }

    fn expire(&self, id: NotificationId) {
        if self.remove(id).is_some() {
            debug!(notification_id = %id, "notification expired");
            let _ = self.events.send(NotificationEvent::Dismissed {
                id,
                reason: DismissReason::Expired,
            });
        }
    }

    fn remove(&self, id: NotificationId) -> Option<Entry> {
        let mut state = self.state();
        let index = state
            .entries
            .iter()
            .position(|entry| entry.notification.id == id)?;
        Some(state.entries.remove(index))
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for NotificationQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in state.entries.drain(..) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}

async fn expire_after(queue: Weak<NotificationQueue>, id: NotificationId, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(queue) = queue.upgrade() {
        queue.expire(id);
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
