use std::path::PathBuf;
use std::sync::Arc;

use chatfs_core::{ChatFsConfig, HttpChatTransport, Index, RemoteProvider};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "chatfs")]
#[command(about = "Chat-backed file system provider (core library smoke CLI)", long_about = None)]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, discover or bootstrap the index, and print provider status.
    Connect,
    /// Connect, then print the current remote index as a tab-separated listing.
    ShowIndex,
    /// Scan `local_path` and push its index to the remote.
    Sync,
    /// Read a byte range from a file through the provider and print its length.
    Read {
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 64)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = ChatFsConfig::load(cli.config.as_deref())?;

    let transport = Arc::new(HttpChatTransport::new(
        config
            .api_base_url
            .clone()
            .unwrap_or_else(|| "https://api.example.invalid".to_string()),
        config.bot_token.clone().unwrap_or_default(),
    ));
    let provider = Arc::new(RemoteProvider::new(transport, config.clone())?);

    match cli.cmd {
        Command::Connect => {
            provider.connect().await?;
            println!("status: {:?}", provider.status().await);
            provider.shutdown().await;
        }
        Command::ShowIndex => {
            provider.connect().await?;
            match provider.snapshot_index().await {
                Some(index) => {
                    for entry in index.entries() {
                        println!("{}\t{}", entry.relative_path, entry.length);
                    }
                }
                None => println!("no index available"),
            }
            provider.shutdown().await;
        }
        Command::Sync => {
            provider.connect().await?;
            let local = Index::build_for_directory(&config.local_path)?;
            provider.write_index(&local).await?;
            println!("synced {} entries", local.len());
            provider.shutdown().await;
        }
        Command::Read { path, offset, count } => {
            provider.connect().await?;
            let mut stream =
                chatfs_core::ReadStream::open(provider.clone(), &path, CancellationToken::new())
                    .await?;
            let mut buf = vec![0u8; count];
            let outcome = stream.read(&mut buf, 0, offset, count).await?;
            if let Some(err) = outcome.error {
                eprintln!("read error: {err}");
            } else {
                println!("read {} bytes", outcome.bytes_read);
            }
            provider.shutdown().await;
        }
    }

    Ok(())
}
