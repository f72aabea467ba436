use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier::protocol::body::{from_body, FileEvent, SearchHit};
use courier::{
    logging, Client, ClientEvent, Config, FrameKind, MediaKind, MemoryStore, OutboundTransfer,
    Server,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "courier - framed TCP messaging with file transfer")]
struct Cli {
    /// Config file (defaults to <config dir>/courier/config.toml)
    #[arg(long, global = true, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server
    Serve {
        /// Bind address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
        /// Storage directory, overrides the config file
        #[arg(long)]
        storage: Option<PathBuf>,
    },
    /// Upload a file (or voice clip) to another user
    Send {
        #[command(flatten)]
        account: Account,
        /// Recipient username
        to: String,
        /// File to send
        path: PathBuf,
        /// Send as audio with this duration in milliseconds
        #[arg(long)]
        audio_ms: Option<u32>,
        #[arg(long)]
        mime: Option<String>,
        /// Message id this upload replies to
        #[arg(long)]
        reply_to: Option<i64>,
    },
    /// Download a stored file
    Download {
        #[command(flatten)]
        account: Account,
        file_id: i64,
        /// Destination directory
        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },
    /// Send a direct message and print the reply status
    Dm {
        #[command(flatten)]
        account: Account,
        to: String,
        message: String,
        #[arg(long)]
        reply_to: Option<i64>,
    },
    /// Print recent history with a peer
    History {
        #[command(flatten)]
        account: Account,
        peer: String,
        #[arg(long, default_value_t = 0)]
        limit: u32,
    },
    /// Search messages
    Search {
        #[command(flatten)]
        account: Account,
        query: String,
        #[arg(long)]
        peer: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: u32,
    },
}

#[derive(clap::Args, Debug)]
struct Account {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:9040", env = "COURIER_SERVER")]
    server: String,
    #[arg(long, short, env = "COURIER_USER")]
    user: String,
    #[arg(long, env = "COURIER_PASSWORD", hide_env_values = true)]
    password: String,
    /// Register the account before logging in
    #[arg(long)]
    register: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = Config::load_or_default(cli.config.as_deref())
        .with_context(|| "failed to load configuration")?;

    match cli.command {
        Command::Serve { bind, storage } => {
            let mut server_config = config.server;
            if let Some(bind) = bind {
                server_config.bind = bind;
            }
            if let Some(storage) = storage {
                server_config.storage_dir = storage;
            }
            let blob_dir = server_config.storage_dir.join("blobs");
            let store = Arc::new(MemoryStore::new(blob_dir));
            let server = Server::bind(server_config, store)
                .await
                .context("failed to start server")?;
            eprintln!("courier listening on {}", server.local_addr()?);
            server
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        Command::Send {
            account,
            to,
            path,
            audio_ms,
            mime,
            reply_to,
        } => {
            let (client, _events) = connect(&account, &config).await?;
            let mut transfer = match audio_ms {
                Some(ms) => {
                    let data = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    let mut t = OutboundTransfer::audio(to, data, ms);
                    if let Some(name) = path.file_name() {
                        t.name = name.to_string_lossy().into_owned();
                    }
                    t
                }
                None => OutboundTransfer::file(to, path),
            };
            if let Some(mime) = mime {
                transfer = transfer.with_mime(mime);
            }
            if let Some(id) = reply_to {
                transfer = transfer.with_reply_to(id);
            }
            let saved = client.send_with_ack(&transfer).await?;
            println!(
                "sent: file {} (message {}, {} bytes)",
                saved.file_id, saved.message_id, saved.bytes
            );
        }
        Command::Download {
            account,
            file_id,
            dest,
        } => {
            let (client, mut events) = connect(&account, &config).await?;
            if !client.request_download(file_id, &dest).await? {
                bail!("download of file {} already in progress", file_id);
            }
            while let Some(event) = events.recv().await {
                match event {
                    ClientEvent::DownloadFinished { path, bytes, .. } => {
                        println!("saved {} ({} bytes)", path.display(), bytes);
                        return Ok(());
                    }
                    ClientEvent::DownloadFailed { reason, .. } => bail!("download failed: {}", reason),
                    ClientEvent::Disconnected => bail!("server closed the connection"),
                    other => print_event(other),
                }
            }
        }
        Command::Dm {
            account,
            to,
            message,
            reply_to,
        } => {
            let (client, mut events) = connect(&account, &config).await?;
            client.send_dm(&to, &message, reply_to).await?;
            let wait = config.client.ack_timeout();
            loop {
                match tokio::time::timeout(wait, events.recv()).await {
                    Ok(Some(ClientEvent::Ack(ack))) => {
                        println!("{} (message {})", ack.body, ack.transfer_id);
                        break;
                    }
                    Ok(Some(ClientEvent::Error(err))) => bail!("{}", err.body),
                    Ok(Some(ClientEvent::Disconnected)) | Ok(None) => {
                        bail!("server closed the connection")
                    }
                    Ok(Some(other)) => print_event(other),
                    Err(_) => bail!("no reply within {:?}", wait),
                }
            }
        }
        Command::History {
            account,
            peer,
            limit,
        } => {
            let (client, mut events) = connect(&account, &config).await?;
            let n = client.history(&peer, limit).await?;
            drain_events(&mut events);
            println!("{} message(s)", n);
        }
        Command::Search {
            account,
            query,
            peer,
            limit,
        } => {
            let (client, mut events) = connect(&account, &config).await?;
            let n = client.search(&query, peer.as_deref(), limit).await?;
            drain_events(&mut events);
            println!("{} hit(s)", n);
        }
    }

    Ok(())
}

async fn connect(
    account: &Account,
    config: &Config,
) -> Result<(Client, mpsc::UnboundedReceiver<ClientEvent>)> {
    let (mut client, events) = Client::connect(account.server.as_str(), config.client.clone())
        .await
        .with_context(|| format!("failed to connect to {}", account.server))?;
    if account.register {
        client.register(&account.user, &account.password).await?;
    }
    client.login(&account.user, &account.password).await?;
    Ok((client, events))
}

/// Print whatever arrived before the final ACK.
fn drain_events(events: &mut mpsc::UnboundedReceiver<ClientEvent>) {
    while let Ok(event) = events.try_recv() {
        print_event(event);
    }
}

fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::Incoming(frame) => match frame.kind {
            FrameKind::Dm => println!("{}: {}", frame.sender, frame.body),
            FrameKind::History => println!("{}", frame.body),
            FrameKind::SearchHit => match from_body::<SearchHit>(&frame.body) {
                Ok(hit) => println!("#{} {} -> {}: {}", hit.message_id, hit.from, hit.to, hit.body),
                Err(_) => println!("{}", frame.body),
            },
            FrameKind::FileEvt | FrameKind::AudioEvt => match from_body::<FileEvent>(&frame.body) {
                Ok(evt) => {
                    let media = if frame.kind == FrameKind::AudioEvt {
                        MediaKind::Audio
                    } else {
                        MediaKind::File
                    };
                    println!(
                        "{}: {} (file {}, {} bytes)",
                        evt.from,
                        courier::store::file_label(media, &evt.name, &evt.mime),
                        evt.file_id,
                        evt.bytes
                    )
                }
                Err(_) => println!("{}", frame.body),
            },
            _ => println!("{:?} {}", frame.kind, frame.body),
        },
        ClientEvent::Ack(frame) => println!("{}", frame.body),
        ClientEvent::Error(frame) => eprintln!("error: {}", frame.body),
        _ => {}
    }
}
