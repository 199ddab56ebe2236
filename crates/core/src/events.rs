//! Asynchronous notifications the host subscribes to: provider readiness and
//! per-file changes observed during sync.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    NotReady,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Deleted,
    Modified,
    All,
}

#[derive(Debug, Clone)]
pub struct Placeholder {
    pub relative_path: String,
    pub length: u64,
    pub mtime: DateTime<Utc>,
    pub hash: [u8; 16],
}

#[derive(Debug, Clone)]
pub struct FileChangeEvent {
    pub change_type: ChangeType,
    pub old_relative_path: Option<String>,
    pub placeholder: Option<Placeholder>,
    pub resync_subdirectories: bool,
}

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    StateChange(ProviderStatus),
    FileChange(FileChangeEvent),
}

/// Best-effort, at-least-once event bus. Duplicates are tolerable; a slow or
/// absent subscriber never blocks the provider.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProviderEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.sender.subscribe()
    }

    pub fn emit_state_change(&self, status: ProviderStatus) {
        let _ = self.sender.send(ProviderEvent::StateChange(status));
    }

    pub fn emit_file_change(&self, event: FileChangeEvent) {
        let _ = self.sender.send(ProviderEvent::FileChange(event));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
