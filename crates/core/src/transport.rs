//! Abstraction over the chat service the provider uses as a backing store,
//! plus a `reqwest`-based production adapter and an in-memory test double.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub author_id: String,
    pub edited_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: Option<String> },
    MessageUpdated {
        channel: ChannelHandle,
        message: Message,
    },
}

/// Capabilities the provider state machine needs from the chat service.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    async fn get_or_create_channel(&self, name: &str) -> Result<ChannelHandle>;
    async fn get_pinned_messages(&self, channel: &ChannelHandle) -> Result<Vec<Message>>;
    async fn get_message(&self, channel: &ChannelHandle, message_id: &str) -> Result<Message>;
    async fn send_files(
        &self,
        channel: &ChannelHandle,
        text: &str,
        attachments: Vec<(String, Vec<u8>)>,
    ) -> Result<Message>;
    async fn pin(&self, channel: &ChannelHandle, message: &Message) -> Result<()>;
    async fn edit_attachments(
        &self,
        channel: &ChannelHandle,
        message: &Message,
        attachments: Vec<(String, Vec<u8>)>,
    ) -> Result<Message>;
    async fn fetch_attachment_bytes(&self, url: &str) -> Result<Vec<u8>>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Production adapter against a generic bot-style HTTP chat API, modeled on
/// a Telegram-Bot-API-shaped `sendDocument`/`getFile` surface.
pub struct HttpChatTransport {
    client: reqwest::Client,
    api_base_url: String,
    bot_token: String,
    events: broadcast::Sender<TransportEvent>,
}

impl HttpChatTransport {
    pub fn new(api_base_url: impl Into<String>, bot_token: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client configuration is static and valid"),
            api_base_url: api_base_url.into(),
            bot_token: bot_token.into(),
            events,
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base_url, self.bot_token, method)
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        form: reqwest::multipart::Form,
    ) -> Result<T> {
        let resp = self
            .client
            .post(self.endpoint(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::NetworkUnavailable {
                message: format!("{method} request failed: {e}"),
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::NetworkUnavailable {
            message: format!("{method} read response failed: {e}"),
        })?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited {
                retry_after_ms: 1000,
            });
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::PermissionDenied {
                message: format!("{method}: {body}"),
            });
        }
        if !status.is_success() {
            return Err(Error::NetworkUnavailable {
                message: format!("{method} http {status}: {body}"),
            });
        }

        let parsed: BotApiResponse<T> =
            serde_json::from_str(&body).map_err(|e| Error::NetworkUnavailable {
                message: format!("{method} invalid json: {e}; body={body}"),
            })?;
        if !parsed.ok {
            return Err(Error::NetworkUnavailable {
                message: parsed
                    .description
                    .unwrap_or_else(|| format!("{method} returned ok=false")),
            });
        }
        parsed.result.ok_or_else(|| Error::NetworkUnavailable {
            message: format!("{method} missing result"),
        })
    }
}

#[async_trait::async_trait]
impl ChatTransport for HttpChatTransport {
    async fn get_or_create_channel(&self, name: &str) -> Result<ChannelHandle> {
        // Channel CRUD and permission setup is delegated to the chat
        // service's own semantics; the adapter treats `name` as the stable
        // channel identifier (a chat/channel id configured out of band).
        Ok(ChannelHandle {
            id: name.to_string(),
            name: name.to_string(),
        })
    }

    async fn get_pinned_messages(&self, channel: &ChannelHandle) -> Result<Vec<Message>> {
        let form = reqwest::multipart::Form::new().text("chat_id", channel.id.clone());
        let chat: BotApiChat = self.call("getChat", form).await?;
        Ok(chat
            .pinned_message
            .map(bot_message_to_message)
            .into_iter()
            .collect())
    }

    async fn get_message(&self, channel: &ChannelHandle, message_id: &str) -> Result<Message> {
        self.get_pinned_messages(channel)
            .await?
            .into_iter()
            .find(|m| m.id == message_id)
            .ok_or(Error::NotFoundRemote)
    }

    async fn send_files(
        &self,
        channel: &ChannelHandle,
        text: &str,
        attachments: Vec<(String, Vec<u8>)>,
    ) -> Result<Message> {
        let mut last = None;
        for (filename, bytes) in attachments {
            let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
            let form = reqwest::multipart::Form::new()
                .text("chat_id", channel.id.clone())
                .text("caption", text.to_string())
                .part("document", part);
            let sent: BotMessage = self.call("sendDocument", form).await?;
            last = Some(sent);
        }
        last.map(bot_message_to_message).ok_or(Error::NotFoundRemote)
    }

    async fn pin(&self, channel: &ChannelHandle, message: &Message) -> Result<()> {
        let form = reqwest::multipart::Form::new()
            .text("chat_id", channel.id.clone())
            .text("message_id", message.id.clone());
        let _: bool = self.call("pinChatMessage", form).await?;
        Ok(())
    }

    async fn edit_attachments(
        &self,
        channel: &ChannelHandle,
        message: &Message,
        attachments: Vec<(String, Vec<u8>)>,
    ) -> Result<Message> {
        // The bot API cannot replace a document attachment in place; the
        // provider replaces the pin, which is externally equivalent to an
        // in-place edit since only the pinned message is ever read back.
        let _ = message;
        let replacement = self
            .send_files(channel, "**FILE DATABASE**\nDo not delete.", attachments)
            .await?;
        self.pin(channel, &replacement).await?;
        Ok(replacement)
    }

    /// Attachment URLs recorded in the index are bot-API `file_id`s, not
    /// directly fetchable URLs; resolve the download path via `getFile`
    /// first, matching the two-step Telegram document download flow.
    async fn fetch_attachment_bytes(&self, file_id: &str) -> Result<Vec<u8>> {
        let form = reqwest::multipart::Form::new().text("file_id", file_id.to_string());
        let file: BotApiFile = self.call("getFile", form).await?;
        let file_path = file.file_path.ok_or(Error::NotFoundRemote)?;
        let download_url = format!(
            "{}/file/bot{}/{file_path}",
            self.api_base_url, self.bot_token
        );

        let resp = self
            .client
            .get(download_url)
            .send()
            .await
            .map_err(|e| Error::NetworkUnavailable {
                message: e.to_string(),
            })?;
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::NetworkUnavailable {
                message: e.to_string(),
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Deserialize)]
struct BotApiFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse<T> {
    ok: bool,
    #[serde(default = "Option::default")]
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotApiChat {
    pinned_message: Option<BotMessage>,
}

#[derive(Debug, Deserialize)]
struct BotMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<BotUser>,
    #[serde(default)]
    edit_date: Option<i64>,
    #[serde(default)]
    document: Option<BotDocument>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct BotDocument {
    file_id: String,
    file_name: Option<String>,
    file_size: Option<u64>,
}

fn bot_message_to_message(m: BotMessage) -> Message {
    Message {
        id: m.message_id.to_string(),
        author_id: m.from.map(|u| u.id.to_string()).unwrap_or_default(),
        edited_at: m
            .edit_date
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        attachments: m
            .document
            .map(|d| {
                vec![Attachment {
                    filename: d.file_name.unwrap_or_default(),
                    url: d.file_id,
                    size: d.file_size.unwrap_or(0),
                }]
            })
            .unwrap_or_default(),
    }
}

/// In-memory test double exercising the same trait the production adapter
/// implements.
#[derive(Default)]
pub struct InMemoryChatTransport {
    channels: Mutex<HashMap<String, ChannelHandle>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    events: Mutex<Option<broadcast::Sender<TransportEvent>>>,
    next_id: Mutex<u64>,
}

impl InMemoryChatTransport {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            events: Mutex::new(Some(tx)),
            ..Default::default()
        }
    }

    fn sender(&self) -> broadcast::Sender<TransportEvent> {
        self.events.lock().unwrap().clone().unwrap()
    }

    fn next_message_id(&self) -> String {
        let mut n = self.next_id.lock().unwrap();
        *n += 1;
        format!("msg-{n}")
    }

    pub fn put_blob(&self, url: &str, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn emit_message_updated(&self, channel: ChannelHandle, message: Message) {
        let _ = self
            .sender()
            .send(TransportEvent::MessageUpdated { channel, message });
    }
}

#[async_trait::async_trait]
impl ChatTransport for InMemoryChatTransport {
    async fn get_or_create_channel(&self, name: &str) -> Result<ChannelHandle> {
        let mut channels = self.channels.lock().unwrap();
        Ok(channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelHandle {
                id: name.to_string(),
                name: name.to_string(),
            })
            .clone())
    }

    async fn get_pinned_messages(&self, channel: &ChannelHandle) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(&channel.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_message(&self, channel: &ChannelHandle, message_id: &str) -> Result<Message> {
        self.messages
            .lock()
            .unwrap()
            .get(&channel.id)
            .and_then(|msgs| msgs.iter().find(|m| m.id == message_id).cloned())
            .ok_or(Error::NotFoundRemote)
    }

    async fn send_files(
        &self,
        channel: &ChannelHandle,
        _text: &str,
        attachments: Vec<(String, Vec<u8>)>,
    ) -> Result<Message> {
        let id = self.next_message_id();
        let mut blobs = self.blobs.lock().unwrap();
        let mut atts = Vec::new();
        for (filename, bytes) in attachments {
            let url = format!("mem://{id}/{filename}");
            atts.push(Attachment {
                filename,
                size: bytes.len() as u64,
                url: url.clone(),
            });
            blobs.insert(url, bytes);
        }
        drop(blobs);

        let message = Message {
            id,
            author_id: "self".to_string(),
            edited_at: Some(Utc::now()),
            attachments: atts,
        };
        self.messages
            .lock()
            .unwrap()
            .entry(channel.id.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn pin(&self, _channel: &ChannelHandle, _message: &Message) -> Result<()> {
        Ok(())
    }

    async fn edit_attachments(
        &self,
        channel: &ChannelHandle,
        message: &Message,
        attachments: Vec<(String, Vec<u8>)>,
    ) -> Result<Message> {
        let mut blobs = self.blobs.lock().unwrap();
        let mut atts = Vec::new();
        for (filename, bytes) in attachments {
            let url = format!("mem://{}/{filename}", message.id);
            atts.push(Attachment {
                filename,
                size: bytes.len() as u64,
                url: url.clone(),
            });
            blobs.insert(url, bytes);
        }
        drop(blobs);

        let updated = Message {
            id: message.id.clone(),
            author_id: message.author_id.clone(),
            edited_at: Some(Utc::now()),
            attachments: atts,
        };

        let mut messages = self.messages.lock().unwrap();
        let list = messages.entry(channel.id.clone()).or_default();
        if let Some(slot) = list.iter_mut().find(|m| m.id == message.id) {
            *slot = updated.clone();
        } else {
            list.push(updated.clone());
        }
        Ok(updated)
    }

    async fn fetch_attachment_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(Error::NotFoundRemote)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender().subscribe()
    }
}
