//! Remote provider state machine: discovers the pinned index message,
//! maintains readiness, performs full/incremental sync, and owns index
//! writes with loopback-edit suppression.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, EncryptionKey};
use crate::config::ChatFsConfig;
use crate::error::{Error, Result};
use crate::events::{ChangeType, EventBus, FileChangeEvent, Placeholder, ProviderStatus};
use crate::index::{Index, IndexEntry};
use crate::transport::{ChannelHandle, ChatTransport, Message, TransportEvent};

const INDEX_PRIMARY_FILENAME: &str = "index.db";
const PENDING_EDIT_TTL: Duration = Duration::from_secs(30);
const WRITE_CONSISTENCY_WAIT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Discovered,
    Ready,
    Degraded,
}

struct Channels {
    db: ChannelHandle,
    data: ChannelHandle,
}

pub struct RemoteProvider {
    transport: Arc<dyn ChatTransport>,
    config: ChatFsConfig,
    encryption_key: Option<EncryptionKey>,
    events: EventBus,
    cancel: CancellationToken,

    state: RwLock<State>,
    channels: RwLock<Option<Channels>>,
    index_message_id: RwLock<Option<String>>,
    last_known_remote_index: RwLock<Option<Index>>,
    pending_edits: Mutex<Vec<DateTime<Utc>>>,
    full_sync_in_flight: AtomicBool,

    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProvider").finish_non_exhaustive()
    }
}

impl RemoteProvider {
    pub fn new(transport: Arc<dyn ChatTransport>, config: ChatFsConfig) -> Result<Self> {
        let encryption_key = config.encryption_key()?;
        Ok(Self {
            transport,
            config,
            encryption_key,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            state: RwLock::new(State::Disconnected),
            channels: RwLock::new(None),
            index_message_id: RwLock::new(None),
            last_known_remote_index: RwLock::new(None),
            pending_edits: Mutex::new(Vec::new()),
            full_sync_in_flight: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub async fn status(&self) -> ProviderStatus {
        match *self.state.read().await {
            State::Ready => ProviderStatus::Ready,
            _ => ProviderStatus::NotReady,
        }
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.read().await, State::Ready)
    }

    /// Returns an independent deep copy of the last-known remote index, or
    /// `None` if the provider has never synced.
    pub async fn snapshot_index(&self) -> Option<Index> {
        self.last_known_remote_index.read().await.clone()
    }

    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        *self.state.write().await = State::Connecting;
        debug!(event = "provider.connect.start");

        let db = self
            .transport
            .get_or_create_channel(&self.config.db_channel_name)
            .await?;
        let data = self
            .transport
            .get_or_create_channel(&self.config.data_channel_name)
            .await?;
        *self.channels.write().await = Some(Channels { db, data });

        *self.state.write().await = State::Discovered;

        self.discover_or_bootstrap_index().await?;

        *self.state.write().await = State::Ready;
        self.events.emit_state_change(ProviderStatus::Ready);
        info!(event = "provider.connect.ready");

        self.spawn_background_tasks();
        Ok(())
    }

    pub async fn disconnect(&self, reason: Option<String>) {
        warn!(event = "provider.disconnect", reason = reason.as_deref().unwrap_or(""));
        *self.state.write().await = State::Disconnected;
        *self.index_message_id.write().await = None;
        *self.last_known_remote_index.write().await = None;
        self.pending_edits.lock().await.clear();
        self.events.emit_state_change(ProviderStatus::NotReady);
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut handles = self.background.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let resync = Arc::clone(self);
        let resync_handle = tokio::spawn(async move { resync.run_resync_timer().await });

        let expiry = Arc::clone(self);
        let expiry_handle = tokio::spawn(async move { expiry.run_pending_edit_expiry().await });

        let dispatch = Arc::clone(self);
        let dispatch_handle = tokio::spawn(async move { dispatch.run_event_dispatch().await });

        // Spawned after `connect` holds no lock across await, so this never
        // deadlocks against the caller.
        let handles_slot = Arc::clone(self);
        tokio::spawn(async move {
            let mut handles = handles_slot.background.lock().await;
            handles.push(resync_handle);
            handles.push(expiry_handle);
            handles.push(dispatch_handle);
        });
    }

    async fn run_resync_timer(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.resync_period_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.full_sync().await,
            }
        }
    }

    async fn run_pending_edit_expiry(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let mut pending = self.pending_edits.lock().await;
                    pending.retain(|t| {
                        now.signed_duration_since(*t).to_std().unwrap_or(Duration::ZERO)
                            < PENDING_EDIT_TTL
                    });
                }
            }
        }
    }

    async fn run_event_dispatch(self: Arc<Self>) {
        let mut rx = self.transport.subscribe();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Ok(TransportEvent::Disconnected { reason }) => {
                            self.disconnect(reason).await;
                        }
                        Ok(TransportEvent::MessageUpdated { message, .. }) => {
                            self.handle_message_updated(message).await;
                        }
                        Ok(TransportEvent::Connected) => {}
                        Err(_) => break,
                    }
                }
            }
        }
    }

    /// Triggered by an external chat event. Suppresses loopback (our own
    /// `write_index` edits) and otherwise re-syncs against the update.
    async fn handle_message_updated(&self, message: Message) {
        let is_index_message = self.index_message_id.read().await.as_deref() == Some(&message.id);
        if !is_index_message {
            return;
        }

        {
            let mut pending = self.pending_edits.lock().await;
            if !pending.is_empty() {
                pending.remove(0);
                debug!(event = "provider.sync.loopback_suppressed");
                return;
            }
        }

        if let Err(e) = self.retrieve_index(&message).await {
            error!(event = "provider.sync.decode_failed", error = %e);
        }
    }

    /// Locates the pinned index message per the identification rule: cached
    /// id match, or (cache empty) bot-authored message with an `index.db`
    /// attachment, tie-broken by smallest message id.
    async fn discover_or_bootstrap_index(&self) -> Result<()> {
        let db_channel = self.db_channel().await?;
        let pinned = self.transport.get_pinned_messages(&db_channel).await?;

        let candidate = pinned
            .into_iter()
            .filter(|m| {
                m.author_id == self.config.bot_id
                    && m.attachments
                        .iter()
                        .any(|a| a.filename.eq_ignore_ascii_case(INDEX_PRIMARY_FILENAME))
            })
            .min_by(|a, b| a.id.cmp(&b.id));

        match candidate {
            Some(message) => {
                *self.index_message_id.write().await = Some(message.id.clone());
                self.retrieve_index(&message).await?;
            }
            None => {
                self.bootstrap_empty_index(&db_channel).await?;
            }
        }
        Ok(())
    }

    async fn bootstrap_empty_index(&self, db_channel: &ChannelHandle) -> Result<()> {
        let empty = Index::new(Utc::now());
        let attachments = self.encode_index_attachments(&empty);
        let message = self
            .transport
            .send_files(db_channel, "**FILE DATABASE**\nDo not delete.", attachments)
            .await?;
        self.transport.pin(db_channel, &message).await?;
        *self.index_message_id.write().await = Some(message.id.clone());
        *self.last_known_remote_index.write().await = Some(empty);
        info!(event = "provider.bootstrap.empty_index");
        Ok(())
    }

    /// Downloads and decodes the index message's attachments, diffing
    /// against the previous snapshot when one exists and emitting
    /// `FileChange` events for the delta.
    async fn retrieve_index(&self, message: &Message) -> Result<()> {
        let mut sorted = message.attachments.clone();
        sorted.sort_by(|a, b| a.filename.to_lowercase().cmp(&b.filename.to_lowercase()));

        let mut serialized = Vec::new();
        for attachment in &sorted {
            let mut piece = self.transport.fetch_attachment_bytes(&attachment.url).await?;
            serialized.append(&mut piece);
        }

        let remote = Index::deserialize(&serialized).map_err(|e| Error::IndexDecodeFailed {
            message: e.to_string(),
        })?;

        let previous = self.last_known_remote_index.read().await.clone();
        match previous {
            None => {
                debug!(event = "provider.sync.cold_start", entries = remote.len());
            }
            Some(previous) => {
                let local = Index::build_for_directory(&self.config.local_path)?;
                let diff = local.diff(&remote);
                for entry in diff.added {
                    self.emit_change(ChangeType::Created, None, Some(&entry));
                }
                for entry in diff.deleted {
                    self.emit_change(ChangeType::Deleted, Some(entry.relative_path.clone()), None);
                }
                for entry in diff.modified {
                    self.emit_change(ChangeType::Modified, None, Some(&entry));
                }
                let _ = previous;
            }
        }

        *self.last_known_remote_index.write().await = Some(remote);
        Ok(())
    }

    fn emit_change(
        &self,
        change_type: ChangeType,
        old_relative_path: Option<String>,
        entry: Option<&IndexEntry>,
    ) {
        let placeholder = entry.map(|e| Placeholder {
            relative_path: e.relative_path.clone(),
            length: e.length,
            mtime: e.mtime,
            hash: e.hash,
        });
        self.events.emit_file_change(FileChangeEvent {
            change_type,
            old_relative_path,
            placeholder,
            resync_subdirectories: false,
        });
    }

    /// Writes `index` as the new remote index, recording the resulting edit
    /// timestamp in `pending_edits` so the subsequent `message_updated`
    /// event is recognized as self-originated.
    pub async fn write_index(&self, index: &Index) -> Result<()> {
        if !self.is_ready().await {
            return Err(Error::NotReady);
        }

        let db_channel = self.db_channel().await?;
        let message_id = self.index_message_id.read().await.clone();

        let attachments = self.encode_index_attachments(index);

        let message = match message_id {
            Some(id) => match self.transport.get_message(&db_channel, &id).await {
                Ok(existing) => {
                    self.transport
                        .edit_attachments(&db_channel, &existing, attachments)
                        .await?
                }
                Err(Error::NotFoundRemote) => {
                    warn!(event = "provider.write_index.message_missing_reposting");
                    let reposted = self
                        .transport
                        .send_files(&db_channel, "**FILE DATABASE**\nDo not delete.", attachments)
                        .await?;
                    self.transport.pin(&db_channel, &reposted).await?;
                    reposted
                }
                Err(e) => return Err(e),
            },
            None => return Err(Error::IndexMessageMissing),
        };

        tokio::time::sleep(WRITE_CONSISTENCY_WAIT).await;
        let refetched = self.transport.get_message(&db_channel, &message.id).await?;

        *self.index_message_id.write().await = Some(refetched.id.clone());
        *self.last_known_remote_index.write().await = Some(index.clone());

        let edited_at = refetched.edited_at.unwrap_or_else(Utc::now);
        self.pending_edits.lock().await.push(edited_at);

        info!(event = "provider.write_index.done", entries = index.len());
        Ok(())
    }

    fn encode_index_attachments(&self, index: &Index) -> Vec<(String, Vec<u8>)> {
        let serialized = index.serialize();
        let piece_size = codec::chunk_data_size(self.config.max_attachment_size as usize).max(1);

        let mut attachments = Vec::new();
        for (i, piece) in serialized.chunks(piece_size).enumerate() {
            let body = match &self.encryption_key {
                Some(key) => codec::encode(piece, i as u32, Some(key), true),
                None => codec::encode(piece, i as u32, None, true),
            };
            let filename = if i == 0 {
                INDEX_PRIMARY_FILENAME.to_string()
            } else {
                format!("index_{i}.db")
            };
            attachments.push((filename, body));
        }
        if attachments.is_empty() {
            let body = codec::encode(&[], 0, self.encryption_key.as_ref(), true);
            attachments.push((INDEX_PRIMARY_FILENAME.to_string(), body));
        }
        attachments
    }

    async fn full_sync(&self) {
        if self
            .full_sync_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(event = "provider.full_sync.skipped_in_flight");
            return;
        }

        self.events.emit_file_change(FileChangeEvent {
            change_type: ChangeType::All,
            old_relative_path: None,
            placeholder: None,
            resync_subdirectories: true,
        });

        let result = async {
            let db_channel = self.db_channel().await?;
            let message_id = self
                .index_message_id
                .read()
                .await
                .clone()
                .ok_or(Error::IndexMessageMissing)?;
            let message = self.transport.get_message(&db_channel, &message_id).await?;
            self.retrieve_index(&message).await
        }
        .await;

        if let Err(e) = result {
            error!(event = "provider.full_sync.failed", error = %e);
        } else {
            debug!(event = "provider.full_sync.done");
        }

        self.full_sync_in_flight.store(false, Ordering::SeqCst);
    }

    async fn db_channel(&self) -> Result<ChannelHandle> {
        self.channels
            .read()
            .await
            .as_ref()
            .map(|c| c.db.clone())
            .ok_or(Error::NotReady)
    }

    pub async fn data_channel(&self) -> Result<ChannelHandle> {
        self.channels
            .read()
            .await
            .as_ref()
            .map(|c| c.data.clone())
            .ok_or(Error::NotReady)
    }

    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.encryption_key.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryChatTransport;

    fn test_config(tmp: &std::path::Path) -> ChatFsConfig {
        ChatFsConfig {
            guild_id: "g".to_string(),
            db_channel_name: "db".to_string(),
            data_channel_name: "data".to_string(),
            local_path: tmp.to_path_buf(),
            encryption_key_base64: None,
            max_attachment_size: 8 * 1024 * 1024,
            resync_period_secs: 180,
            bot_token: None,
            api_base_url: None,
            bot_id: "self".to_string(),
        }
    }

    #[tokio::test]
    async fn connect_bootstraps_empty_index() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(InMemoryChatTransport::new());
        let provider = Arc::new(
            RemoteProvider::new(transport.clone(), test_config(tmp.path())).unwrap(),
        );

        provider.connect().await.unwrap();
        assert!(provider.is_ready().await);
        let index = provider.snapshot_index().await.unwrap();
        assert!(index.is_empty());

        provider.shutdown().await;
    }

    #[tokio::test]
    async fn write_index_round_trips_through_transport() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(InMemoryChatTransport::new());
        let provider = Arc::new(
            RemoteProvider::new(transport.clone(), test_config(tmp.path())).unwrap(),
        );
        provider.connect().await.unwrap();

        let mut index = Index::new(Utc::now());
        index.insert(IndexEntry {
            relative_path: "a.txt".to_string(),
            length: 3,
            mtime: Utc::now(),
            hash: [1u8; 16],
            chunks: vec![],
        });

        provider.write_index(&index).await.unwrap();
        let snapshot = provider.snapshot_index().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        provider.shutdown().await;
    }

    #[tokio::test]
    async fn write_index_before_connect_is_not_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(InMemoryChatTransport::new());
        let provider = Arc::new(
            RemoteProvider::new(transport, test_config(tmp.path())).unwrap(),
        );
        let index = Index::new(Utc::now());
        let err = provider.write_index(&index).await.unwrap_err();
        assert!(matches!(err, Error::NotReady));
    }
}
