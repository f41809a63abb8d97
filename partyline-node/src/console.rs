//! Line-oriented console: command parsing and rendering of core output.

use anyhow::{anyhow, bail, Context};
use partyline_core::{BootstrapToken, ChatEntry, JoinState, NodeId, OverlayCore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Id,
    Bootstrap(BootstrapToken),
    Open(NodeId),
    Msg(NodeId, String),
    Peers,
    Keys,
    Leave,
    Help,
    Chat(String),
    Nothing,
}

pub const HELP: &str = "\
/id                  show own id and bootstrap token
/bootstrap, /bs TOK  join the network through TOK
/open ID             open a secure channel to ID
/msg ID TEXT         send TEXT privately to ID
/peers, /pt          routing table
/keys, /kt           known signing keys
/leave, /quit, /exit leave the network and exit
/help                this text
anything else is sent as public chat";

pub fn parse(line: &str) -> anyhow::Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Nothing);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Chat(line.to_owned()));
    };
    let (cmd, args) = match rest.split_once(char::is_whitespace) {
        Some((cmd, args)) => (cmd, args.trim()),
        None => (rest, ""),
    };
    Ok(match cmd {
        "id" => Command::Id,
        "bootstrap" | "bs" => Command::Bootstrap(args.parse().context("bad bootstrap token")?),
        "open" => Command::Open(node_id(args)?),
        "msg" => {
            let (id, text) = args
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: /msg ID TEXT"))?;
            Command::Msg(node_id(id)?, text.trim().to_owned())
        }
        "peers" | "pt" => Command::Peers,
        "keys" | "kt" => Command::Keys,
        "leave" | "quit" | "exit" => Command::Leave,
        "help" | "?" => Command::Help,
        other => bail!("unknown command /{other}, try /help"),
    })
}

fn node_id(s: &str) -> anyhow::Result<NodeId> {
    s.trim()
        .parse()
        .map_err(|_| anyhow!("expected a 64 hex character node id"))
}

/// `HH:MM:SS` (UTC) of a millisecond Unix timestamp.
fn clock(ts_ms: u64) -> String {
    let secs = (ts_ms / 1000) % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub fn render_chat(entry: &ChatEntry) -> String {
    let mark = if entry.verified { "" } else { " (unverified)" };
    match entry.target {
        Some(to) => format!(
            "[{}] {} -> {} (secure): {}",
            clock(entry.ts),
            entry.sender.short(),
            to.short(),
            entry.content
        ),
        None => format!(
            "[{}] {}{}: {}",
            clock(entry.ts),
            entry.sender.short(),
            mark,
            entry.content
        ),
    }
}

pub fn render_id(core: &OverlayCore) -> String {
    let state = match core.state() {
        JoinState::Unjoined => "unjoined",
        JoinState::AwaitingVerify => "awaiting verify",
        JoinState::Verified => "verified",
        JoinState::TableBuilding => "building table",
        JoinState::Ready => "ready",
        JoinState::Isolated => "isolated",
        JoinState::Departed => "departed",
    };
    let token = core
        .bootstrap_token()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "(no IPv4 token)".into());
    format!("id {}\ntoken {token}\nstate {state}", core.id())
}

/// Routing table, runs of slots sharing an occupant collapsed into one line.
pub fn render_peers(core: &OverlayCore) -> String {
    let snapshot = core.routing_snapshot();
    let mut lines = Vec::new();
    let mut start = 0;
    while start < snapshot.len() {
        let occupant = snapshot[start];
        let mut end = start;
        while end + 1 < snapshot.len() && snapshot[end + 1] == occupant {
            end += 1;
        }
        let who = match occupant.and_then(|id| core.routing_table().peer(&id)) {
            Some(p) => format!("{} {}", p.id, p.addr()),
            None => "-".into(),
        };
        lines.push(format!("{start:>3}..{end:<3} {who}"));
        start = end + 1;
    }
    let secure = core.secure_peers();
    if !secure.is_empty() {
        let ids: Vec<String> = secure.iter().map(|id| id.short()).collect();
        lines.push(format!("secure: {}", ids.join(" ")));
    }
    lines.join("\n")
}

pub fn render_keys(core: &OverlayCore) -> String {
    let keys = core.known_keys();
    if keys.is_empty() {
        return "no keys".into();
    }
    keys.iter()
        .map(|(id, key)| format!("{} {}", id.short(), key))
        .collect::<Vec<_>>()
        .join("\n")
}
