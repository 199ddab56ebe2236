mod codec;
mod config;
mod error;
mod events;
mod index;
mod provider;
mod read_stream;
mod transport;

pub const APP_NAME: &str = "ChatFs";

pub use codec::{chunk_data_size, decode, encode, lz4_max_expansion, DecodedChunk, EncryptionKey};
pub use config::ChatFsConfig;
pub use error::{CodecError, Error, Result};
pub use events::{ChangeType, EventBus, FileChangeEvent, Placeholder, ProviderEvent, ProviderStatus};
pub use index::{Index, IndexDiff, IndexEntry, IndexFileChunk};
pub use provider::RemoteProvider;
pub use read_stream::{ReadOutcome, ReadStream};
pub use transport::{
    Attachment, ChannelHandle, ChatTransport, HttpChatTransport, InMemoryChatTransport, Message,
    TransportEvent,
};
