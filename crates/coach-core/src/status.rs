use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Generating,
    Error,
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A status transition, optionally carrying a progress message
/// such as `"Downloading model.gguf... 42%"`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: AdapterStatus,
    pub message: Option<String>,
}

pub type StatusListener = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

/// Current status of one adapter plus the listener it reports to.
///
/// The listener is invoked after the lock is released so it may read the
/// cell again.
#[derive(Default)]
pub struct StatusCell {
    current: RwLock<StatusUpdate>,
    listener: RwLock<Option<StatusListener>>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> AdapterStatus {
        self.current.read().status
    }

    pub fn set(&self, status: AdapterStatus) {
        self.publish(StatusUpdate { status, message: None });
    }

    pub fn set_with_message(&self, status: AdapterStatus, message: impl Into<String>) {
        self.publish(StatusUpdate {
            status,
            message: Some(message.into()),
        });
    }

    /// Move to `next` only if the cell still holds `expected`. Returns whether
    /// the transition happened.
    pub fn transition(&self, expected: AdapterStatus, next: AdapterStatus) -> bool {
        let update = {
            let mut current = self.current.write();
            if current.status != expected {
                return false;
            }
            *current = StatusUpdate { status: next, message: None };
            current.clone()
        };
        self.notify(&update);
        true
    }

    pub fn set_listener(&self, listener: StatusListener) {
        *self.listener.write() = Some(listener);
    }

    fn publish(&self, update: StatusUpdate) {
        *self.current.write() = update.clone();
        self.notify(&update);
    }

    fn notify(&self, update: &StatusUpdate) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(update);
        }
    }
}

impl std::fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCell")
            .field("current", &*self.current.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn listener_sees_every_update() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cell = StatusCell::new();
        let sink = seen.clone();
        cell.set_listener(Arc::new(move |u: &StatusUpdate| sink.lock().push(u.clone())));

        cell.set_with_message(AdapterStatus::Loading, "Loading model into memory...");
        cell.set(AdapterStatus::Ready);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].message.as_deref(), Some("Loading model into memory..."));
        assert_eq!(seen[1].status, AdapterStatus::Ready);
        assert_eq!(cell.get(), AdapterStatus::Ready);
    }

    #[test]
    fn transition_requires_expected_state() {
        let cell = StatusCell::new();
        assert!(!cell.transition(AdapterStatus::Generating, AdapterStatus::Ready));
        assert_eq!(cell.get(), AdapterStatus::Idle);

        cell.set(AdapterStatus::Generating);
        assert!(cell.transition(AdapterStatus::Generating, AdapterStatus::Ready));
        assert_eq!(cell.get(), AdapterStatus::Ready);
    }

    #[test]
    fn status_display_and_serde() {
        assert_eq!(AdapterStatus::Generating.to_string(), "generating");
        assert_eq!(serde_json::to_string(&AdapterStatus::Ready).unwrap(), r#""ready""#);
    }
}
