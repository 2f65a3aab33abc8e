//! Line-oriented console: `/command args`, or plain text to the current conversation.

use std::path::PathBuf;

use parley_core::signaling::MediaKind;
use parley_core::PeerId;

pub const HELP: &str = "\
/open <peer>            connect to a peer and make it current
/msg <peer> <text>      send a message
/accept <peer>          accept a conversation request
/reject <peer>          reject a conversation request
/read <peer>            mark everything from the peer read
/typing <peer> on|off   send typing state
/send <peer> <path>     offer a file
/get <transfer>         accept a file offer
/decline <transfer>     reject a file offer
/cancel <transfer>      cancel a transfer
/call <peer> [video]    start a call
/answer | /hangup | /refuse
/status <text>          publish a status line
/close <peer>           tear the session down
/who                    list online users
/quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open(PeerId),
    Msg(PeerId, String),
    /// Plain text for the current conversation.
    Say(String),
    Accept(PeerId),
    Reject(PeerId),
    Read(PeerId),
    Typing(PeerId, bool),
    SendFile(PeerId, PathBuf),
    GetFile(String),
    DeclineFile(String),
    Cancel(String),
    Call(PeerId, MediaKind),
    Answer,
    Refuse,
    Hangup,
    Status(String),
    Close(PeerId),
    Who,
    Help,
    Quit,
}

pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };
    let (cmd, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    let mut words = args.split_whitespace();
    let mut peer = || {
        words
            .next()
            .map(PeerId::from)
            .ok_or_else(|| format!("/{} needs a peer", cmd))
    };
    let cmd = match cmd {
        "open" => Command::Open(peer()?),
        "msg" => {
            let to = peer()?;
            let text = args
                .split_once(char::is_whitespace)
                .map(|(_, t)| t.trim())
                .unwrap_or("");
            if text.is_empty() {
                return Err("/msg needs text".to_string());
            }
            Command::Msg(to, text.to_string())
        }
        "accept" => Command::Accept(peer()?),
        "reject" => Command::Reject(peer()?),
        "read" => Command::Read(peer()?),
        "typing" => {
            let to = peer()?;
            let on = !matches!(words.next(), Some("off"));
            Command::Typing(to, on)
        }
        "send" => {
            let to = peer()?;
            match words.next() {
                Some(path) => Command::SendFile(to, PathBuf::from(path)),
                None => return Err("/send needs a path".to_string()),
            }
        }
        "get" | "decline" | "cancel" => {
            let id = words
                .next()
                .ok_or_else(|| format!("/{} needs a transfer id", cmd))?
                .to_string();
            match cmd {
                "get" => Command::GetFile(id),
                "decline" => Command::DeclineFile(id),
                _ => Command::Cancel(id),
            }
        }
        "call" => {
            let to = peer()?;
            let kind = match words.next() {
                Some("video") => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            Command::Call(to, kind)
        }
        "answer" => Command::Answer,
        "refuse" => Command::Refuse,
        "hangup" => Command::Hangup,
        "status" => Command::Status(args.to_string()),
        "close" => Command::Close(peer()?),
        "who" => Command::Who,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{} (try /help)", other)),
    };
    Ok(Some(cmd))
}
