// Parley Linux: rendezvous client, TCP peer links, console front end.

mod config;
mod console;
mod media;
mod signaling;
mod transport;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use parley_core::call::CallEvent;
use parley_core::signaling::PresenceChange;
use parley_core::transfer::FileMeta;
use parley_core::{Action, ChatCore, Event, MemoryStore, PeerId};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::console::Command;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const TICK: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("parley-linux {}", VERSION);
            return Ok(());
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> Result<()> {
    let local_id = PeerId::new(cfg.peer_id.clone());
    let (tcp, mut transport_rx) =
        transport::TcpTransport::bind(local_id.clone(), cfg.listen_port, cfg.advertise_addr())
            .await
            .with_context(|| format!("binding port {}", cfg.listen_port))?;
    let mut sig = signaling::Signaling::connect(&cfg.signaling_url, local_id.as_str()).await?;

    let core = ChatCore::new(
        local_id.clone(),
        cfg.core.clone(),
        Box::new(tcp),
        Box::new(media::NoDevices),
        Box::new(MemoryStore::new()),
    );
    let mut app = App {
        core,
        current: None,
        download_dir: cfg.download_dir.clone(),
    };
    println!("parley {} as {} (/help for commands)", VERSION, local_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let mut tick = tokio::time::interval(TICK);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            incoming = sig.next() => match incoming? {
                Some(signal) => app.core.on_signal(signal),
                None => {
                    log::warn!("rendezvous server closed the connection");
                    break;
                }
            },
            Some(event) = transport_rx.recv() => app.core.on_transport_event(event),
            line = lines.next_line(), if console_open => match line? {
                Some(line) => {
                    if !app.command(&line).await {
                        break;
                    }
                }
                None => {
                    log::info!("console closed; running headless");
                    console_open = false;
                }
            },
            _ = tick.tick() => app.core.tick(),
            r = &mut shutdown => {
                r?;
                break;
            }
        }
        app.core.pump();
        for action in app.core.poll() {
            match action {
                Action::Signal(s) => sig.send(&s).await?,
                Action::Notify(e) => app.show(e).await,
            }
        }
    }
    log::info!("shutting down");
    Ok(())
}

struct App {
    core: ChatCore,
    /// Conversation plain console lines go to.
    current: Option<PeerId>,
    download_dir: PathBuf,
}

impl App {
    /// Run one console line. Returns false on quit.
    async fn command(&mut self, line: &str) -> bool {
        let cmd = match console::parse(line) {
            Ok(Some(c)) => c,
            Ok(None) => return true,
            Err(e) => {
                println!("{}", e);
                return true;
            }
        };
        if cmd == Command::Quit {
            return false;
        }
        if let Err(e) = self.run(cmd).await {
            println!("error: {:#}", e);
        }
        true
    }

    async fn run(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Open(peer) => {
                self.core.open(&peer)?;
                self.current = Some(peer);
            }
            Command::Msg(peer, text) => {
                self.core.send_text(&peer, &text)?;
                self.current = Some(peer);
            }
            Command::Say(text) => {
                let peer = self
                    .current
                    .clone()
                    .context("no current conversation; /open <peer> first")?;
                self.core.send_text(&peer, &text)?;
            }
            Command::Accept(peer) => self.core.accept_conversation(&peer)?,
            Command::Reject(peer) => {
                let dropped = self.core.reject_conversation(&peer)?;
                println!("rejected {} ({} held messages dropped)", peer, dropped);
            }
            Command::Read(peer) => self.core.mark_read(&peer, None)?,
            Command::Typing(peer, on) => self.core.set_typing(&peer, on)?,
            Command::SendFile(peer, path) => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let meta = FileMeta {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "file".to_string()),
                    mime: mime_for(&path).to_string(),
                    thumbnail: None,
                };
                let id = self.core.send_file(&peer, meta, data)?;
                println!("offered {} to {} as {}", path.display(), peer, id);
            }
            Command::GetFile(id) => self.core.accept_file(&id)?,
            Command::DeclineFile(id) => self.core.reject_file(&id)?,
            Command::Cancel(id) => self.core.cancel_file(&id)?,
            Command::Call(peer, kind) => self.core.start_call(&peer, kind)?,
            Command::Answer => self.core.accept_call()?,
            Command::Refuse => self.core.reject_call()?,
            Command::Hangup => self.core.hangup()?,
            Command::Status(text) => self.core.set_status(&text),
            Command::Close(peer) => {
                self.core.teardown(&peer);
                if self.current.as_ref() == Some(&peer) {
                    self.current = None;
                }
            }
            Command::Who => {
                let online = self.core.signaling().online();
                if online.is_empty() {
                    println!("nobody online");
                }
                for p in online {
                    let status = self
                        .core
                        .signaling()
                        .presence(&p)
                        .and_then(|s| s.status.clone())
                        .unwrap_or_default();
                    println!("  {} {}", p, status);
                }
            }
            Command::Help => println!("{}", console::HELP),
            Command::Quit => {}
        }
        Ok(())
    }

    async fn show(&mut self, event: Event) {
        match event {
            Event::Presence(PresenceChange::Online(p)) => println!("* {} is online", p),
            Event::Presence(PresenceChange::Offline(p)) => println!("* {} went offline", p),
            Event::Presence(PresenceChange::Status(p, s)) => println!("* {} is {}", p, s),
            Event::Presence(PresenceChange::Snapshot(users)) => {
                println!("* {} users online", users.len())
            }
            Event::ChannelReady(p) => println!("* connected to {}", p),
            Event::ChannelClosed(p) => println!("* connection to {} closed", p),
            Event::EncryptionEstablished(p) => println!("* messages with {} are encrypted", p),
            Event::UnencryptedSend { peer_id, .. } => {
                println!("! message to {} was sent unencrypted", peer_id)
            }
            Event::MessageReceived(m) => {
                let from = match &m.sender {
                    parley_core::message::Sender::Peer(p) => p.to_string(),
                    parley_core::message::Sender::Local => "me".to_string(),
                };
                println!("[{}] {}: {}", m.timestamp.format("%H:%M"), from, m.content)
            }
            Event::MessagePendingAuthorization { peer_id, .. } => println!(
                "* {} wants to talk: /accept {} or /reject {}",
                peer_id, peer_id, peer_id
            ),
            Event::Undecryptable { peer_id, .. } => {
                println!("! a message from {} could not be decrypted", peer_id)
            }
            Event::StatusChanged(c) => {
                log::debug!("{} to {} is {:?}", c.message_id, c.peer_id, c.status)
            }
            Event::Typing { peer_id, typing } => {
                if typing {
                    println!("* {} is typing", peer_id)
                }
            }
            Event::AuthAccepted(p) => println!("* {} accepted the conversation", p),
            Event::AuthRefused(p) => println!("! {} refused the conversation", p),
            Event::FileOffered(t) => println!(
                "* {} offers {} ({} bytes): /get {} or /decline {}",
                t.peer_id, t.meta.name, t.total, t.id, t.id
            ),
            Event::TransferStarted(id) => println!("* transfer {} started", id),
            Event::TransferProgress {
                transfer_id,
                transferred,
                total,
                ..
            } => log::debug!("{}: {}/{}", transfer_id, transferred, total),
            Event::TransferCompleted { transfer_id, data } => match data {
                Some(bytes) => self.save(&transfer_id, bytes).await,
                None => println!("* transfer {} delivered", transfer_id),
            },
            Event::TransferFailed {
                transfer_id,
                reason,
            } => println!("! transfer {} failed: {}", transfer_id, reason),
            Event::TransferRejected(id) => println!("* transfer {} was declined", id),
            Event::TransferCancelled(id) => println!("* transfer {} was cancelled", id),
            Event::Call(CallEvent::Incoming { peer_id, kind }) => {
                println!("* {:?} call from {}: /answer or /refuse", kind, peer_id)
            }
            Event::Call(CallEvent::Active(p)) => println!("* in call with {}", p),
            Event::Call(CallEvent::Ended { peer_id, reason })
            | Event::Call(CallEvent::Failed { peer_id, reason }) => {
                println!("* call with {} ended ({})", peer_id, reason.as_str())
            }
            Event::Call(CallEvent::MissedWhileBusy(p)) => println!("* missed call from {}", p),
            Event::Call(other) => log::info!("call: {:?}", other),
            Event::MediaAcquisitionFailed { peer_id, error } => {
                println!("! cannot answer {}: {}", peer_id, error)
            }
            Event::PeerState { peer_id, state } => log::debug!("{} is {:?}", peer_id, state),
            Event::Reconnecting { peer_id, attempt } => {
                println!("* reconnecting to {} (attempt {})", peer_id, attempt)
            }
            Event::RelayFallback(p) => {
                println!("! cannot reach {} directly; no relay is configured", p)
            }
        }
    }

    async fn save(&self, transfer_id: &str, bytes: Vec<u8>) {
        let name = self
            .core
            .transfer(transfer_id)
            .map(|t| t.meta.name.clone())
            .unwrap_or_else(|| transfer_id.to_string());
        // Never let a remote name escape the download directory.
        let name = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| transfer_id.to_string());
        let path = self.download_dir.join(name);
        let result = async {
            tokio::fs::create_dir_all(&self.download_dir).await?;
            tokio::fs::write(&path, &bytes).await
        }
        .await;
        match result {
            Ok(()) => println!("* saved {} ({} bytes)", path.display(), bytes.len()),
            Err(e) => log::warn!("could not save {}: {}", path.display(), e),
        }
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
