//! Control-channel server (§4.9, §6): the frontend-facing command and
//! event surface, exposed over a Unix-domain socket at
//! `<workdir>/sphubd.sock`. Grounded on `original_source/sphubd/ui.c`
//! and `ui_list.c` for the command vocabulary and snapshot ordering.

use shakes_core::Nick;
use thiserror::Error;

use crate::notify::Event;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("missing argument for {0}")]
    MissingArgument(String),
}

/// Handshake levels a frontend announces on connect (§4.9): `0`
/// issues commands only, `100` additionally wants the hub/roster
/// snapshot, `200` wants the full snapshot including the queue and
/// share index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitLevel {
    Commands = 0,
    HubSnapshot = 100,
    FullSnapshot = 200,
}

impl InitLevel {
    pub fn from_wire(n: u32) -> Option<Self> {
        match n {
            0 => Some(Self::Commands),
            100 => Some(Self::HubSnapshot),
            200 => Some(Self::FullSnapshot),
            _ => None,
        }
    }
}

/// The fixed order snapshot sections are pushed in on connect, so a
/// frontend can always render hubs before rosters before transfers
/// without buffering out-of-order state.
pub const SNAPSHOT_PUSH_ORDER: &[&str] = &["hubs", "roster", "queue", "share", "transfers"];

/// §6's command surface. Not every command the original `ui.c`
/// recognizes is implemented; the deliberately-omitted ones
/// (`search-all`, `set-allow-hub-ip-override`, `set-password`,
/// `update-user-info`, `forget-search`, `raw-command`,
/// `set-follow-redirects`, `queue-remove-filelist`,
/// `queue-remove-directory`) are recorded in `DESIGN.md`.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlCommand {
    Init { level: InitLevel },
    ConnectHub { address: String },
    DisconnectHub { hub_id: u64 },
    SendChat { hub_id: u64, text: String },
    SendPrivateMessage { hub_id: u64, to: Nick, text: String },
    Search { hub_id: u64, pattern: String },
    AddShare { local_path: String },
    RemoveShare { virtual_root: String },
    QueueAdd { virtual_path: String, hub_id: u64, nick: Nick },
    QueueRemove { target_id: u64 },
    QueueRemoveSource { target_id: u64, hub_id: u64, nick: Nick },
    SetPriority { target_id: u64, priority: String },
    DownloadFile { virtual_path: String, hub_id: u64, nick: Nick },
    DownloadFilelist { hub_id: u64, nick: Nick },
    DownloadDirectory { virtual_path: String, hub_id: u64, nick: Nick },
    CancelTransfer { peer_id: u64 },
    SetSlots { total_slots: u32 },
    SetPassive { passive: bool },
    GrantSlot { nick: Nick },
    PauseHashing,
    ResumeHashing,
    SetAutoSearch { enabled: bool },
    SetHashPriority { priority: u8 },
    SetDownloadDirectory { path: String },
    SetIncompleteDirectory { path: String },
    RescanShareInterval { seconds: u64 },
    SetIpOverride { ip: String },
    SetPort { port: u16 },
    Shutdown,
    Quit,
}

/// Parse one `\n`-terminated control-channel line into a command. The
/// wire format is tab-separated fields, first field the command name
/// — deliberately simpler than NMDC's `$`/`|` framing since this
/// channel is local-only.
pub fn parse_command(line: &str) -> Result<ControlCommand, ControlError> {
    let line = line.trim_end();
    let mut fields = line.split('\t');
    let cmd = fields.next().filter(|s| !s.is_empty()).ok_or(ControlError::Empty)?;

    match cmd {
        "init" => {
            let level = fields.next().ok_or_else(|| ControlError::MissingArgument("level".into()))?;
            let n: u32 = level.parse().map_err(|_| ControlError::MissingArgument("level".into()))?;
            InitLevel::from_wire(n).map(|level| ControlCommand::Init { level }).ok_or(ControlError::Unknown(line.to_string()))
        }
        "connect-hub" => {
            let address = fields.next().ok_or_else(|| ControlError::MissingArgument("address".into()))?;
            Ok(ControlCommand::ConnectHub { address: address.to_string() })
        }
        "disconnect-hub" => {
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            Ok(ControlCommand::DisconnectHub { hub_id })
        }
        "chat" => {
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            let text = fields.next().ok_or_else(|| ControlError::MissingArgument("text".into()))?;
            Ok(ControlCommand::SendChat { hub_id, text: text.to_string() })
        }
        "pm" => {
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            let to = fields.next().ok_or_else(|| ControlError::MissingArgument("to".into()))?;
            let text = fields.next().ok_or_else(|| ControlError::MissingArgument("text".into()))?;
            Ok(ControlCommand::SendPrivateMessage { hub_id, to: Nick::new(to), text: text.to_string() })
        }
        "search" => {
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            let pattern = fields.next().ok_or_else(|| ControlError::MissingArgument("pattern".into()))?;
            Ok(ControlCommand::Search { hub_id, pattern: pattern.to_string() })
        }
        "add-share" => {
            let local_path = fields.next().ok_or_else(|| ControlError::MissingArgument("local_path".into()))?;
            Ok(ControlCommand::AddShare { local_path: local_path.to_string() })
        }
        "remove-share" => {
            let virtual_root = fields.next().ok_or_else(|| ControlError::MissingArgument("virtual_root".into()))?;
            Ok(ControlCommand::RemoveShare { virtual_root: virtual_root.to_string() })
        }
        "queue-add" => {
            let virtual_path = fields.next().ok_or_else(|| ControlError::MissingArgument("virtual_path".into()))?;
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            let nick = fields.next().ok_or_else(|| ControlError::MissingArgument("nick".into()))?;
            Ok(ControlCommand::QueueAdd { virtual_path: virtual_path.to_string(), hub_id, nick: Nick::new(nick) })
        }
        "queue-remove" => {
            let target_id = parse_u64(fields.next(), "target_id")?;
            Ok(ControlCommand::QueueRemove { target_id })
        }
        "set-priority" => {
            let target_id = parse_u64(fields.next(), "target_id")?;
            let priority = fields.next().ok_or_else(|| ControlError::MissingArgument("priority".into()))?;
            Ok(ControlCommand::SetPriority { target_id, priority: priority.to_string() })
        }
        "queue-remove-source" => {
            let target_id = parse_u64(fields.next(), "target_id")?;
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            let nick = fields.next().ok_or_else(|| ControlError::MissingArgument("nick".into()))?;
            Ok(ControlCommand::QueueRemoveSource { target_id, hub_id, nick: Nick::new(nick) })
        }
        "download-file" => {
            let virtual_path = fields.next().ok_or_else(|| ControlError::MissingArgument("virtual_path".into()))?;
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            let nick = fields.next().ok_or_else(|| ControlError::MissingArgument("nick".into()))?;
            Ok(ControlCommand::DownloadFile { virtual_path: virtual_path.to_string(), hub_id, nick: Nick::new(nick) })
        }
        "download-filelist" => {
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            let nick = fields.next().ok_or_else(|| ControlError::MissingArgument("nick".into()))?;
            Ok(ControlCommand::DownloadFilelist { hub_id, nick: Nick::new(nick) })
        }
        "download-directory" => {
            let virtual_path = fields.next().ok_or_else(|| ControlError::MissingArgument("virtual_path".into()))?;
            let hub_id = parse_u64(fields.next(), "hub_id")?;
            let nick = fields.next().ok_or_else(|| ControlError::MissingArgument("nick".into()))?;
            Ok(ControlCommand::DownloadDirectory { virtual_path: virtual_path.to_string(), hub_id, nick: Nick::new(nick) })
        }
        "cancel-transfer" => {
            let peer_id = parse_u64(fields.next(), "peer_id")?;
            Ok(ControlCommand::CancelTransfer { peer_id })
        }
        "set-slots" => {
            let total_slots = parse_u64(fields.next(), "total_slots")? as u32;
            Ok(ControlCommand::SetSlots { total_slots })
        }
        "set-passive" => {
            let passive = fields.next().ok_or_else(|| ControlError::MissingArgument("passive".into()))?;
            Ok(ControlCommand::SetPassive { passive: passive == "true" || passive == "1" })
        }
        "grant-slot" => {
            let nick = fields.next().ok_or_else(|| ControlError::MissingArgument("nick".into()))?;
            Ok(ControlCommand::GrantSlot { nick: Nick::new(nick) })
        }
        "pause-hashing" => Ok(ControlCommand::PauseHashing),
        "resume-hashing" => Ok(ControlCommand::ResumeHashing),
        "set-auto-search" => {
            let enabled = fields.next().ok_or_else(|| ControlError::MissingArgument("enabled".into()))?;
            Ok(ControlCommand::SetAutoSearch { enabled: enabled == "true" || enabled == "1" })
        }
        "set-hash-priority" => {
            let priority = parse_u64(fields.next(), "priority")? as u8;
            Ok(ControlCommand::SetHashPriority { priority })
        }
        "set-download-directory" => {
            let path = fields.next().ok_or_else(|| ControlError::MissingArgument("path".into()))?;
            Ok(ControlCommand::SetDownloadDirectory { path: path.to_string() })
        }
        "set-incomplete-directory" => {
            let path = fields.next().ok_or_else(|| ControlError::MissingArgument("path".into()))?;
            Ok(ControlCommand::SetIncompleteDirectory { path: path.to_string() })
        }
        "rescan-share-interval" => {
            let seconds = parse_u64(fields.next(), "seconds")?;
            Ok(ControlCommand::RescanShareInterval { seconds })
        }
        "set-ip-override" => {
            let ip = fields.next().ok_or_else(|| ControlError::MissingArgument("ip".into()))?;
            Ok(ControlCommand::SetIpOverride { ip: ip.to_string() })
        }
        "set-port" => {
            let port = parse_u64(fields.next(), "port")? as u16;
            Ok(ControlCommand::SetPort { port })
        }
        "shutdown" => Ok(ControlCommand::Shutdown),
        "quit" => Ok(ControlCommand::Quit),
        other => Err(ControlError::Unknown(other.to_string())),
    }
}

fn parse_u64(field: Option<&str>, name: &str) -> Result<u64, ControlError> {
    field
        .ok_or_else(|| ControlError::MissingArgument(name.into()))?
        .parse()
        .map_err(|_| ControlError::MissingArgument(name.into()))
}

/// Serialize an [`Event`] to one control-channel line for a connected
/// frontend.
pub fn format_event(event: &Event) -> String {
    match event {
        Event::HubConnecting { hub_id, address } => format!("hub-connecting\t{}\t{}", hub_id, address),
        Event::HubConnected { hub_id } => format!("hub-connected\t{}", hub_id),
        Event::HubDisconnected { hub_id, reason } => format!("hub-disconnected\t{}\t{}", hub_id, reason),
        Event::HubRedirect { hub_id, target } => format!("hub-redirect\t{}\t{}", hub_id, target),
        Event::ChatMessage { hub_id, nick, text } => format!("chat\t{}\t{}\t{}", hub_id, nick, text),
        Event::PrivateMessage { hub_id, from, text } => format!("pm\t{}\t{}\t{}", hub_id, from, text),
        Event::UserJoin { hub_id, nick } => format!("user-join\t{}\t{}", hub_id, nick),
        Event::UserQuit { hub_id, nick } => format!("user-quit\t{}\t{}", hub_id, nick),
        Event::SearchResult { hub_id, from, tth, filename, size, free_slots } => format!(
            "search-result\t{}\t{}\t{}\t{}\t{}\t{}",
            hub_id,
            from,
            tth.map(|t| t.to_base32()).unwrap_or_default(),
            filename,
            size,
            free_slots
        ),
        Event::QueueAdded { target_id, filename } => format!("queue-added\t{}\t{}", target_id, filename),
        Event::QueueRemoved { target_id } => format!("queue-removed\t{}", target_id),
        Event::TransferStarted { target_id, peer, direction } => {
            format!("transfer-started\t{}\t{}\t{:?}", target_id, peer, direction)
        }
        Event::TransferProgress { target_id, bytes_done, bytes_total } => {
            format!("transfer-progress\t{}\t{}\t{}", target_id, bytes_done, bytes_total)
        }
        Event::TransferFinished { target_id, direction } => format!("transfer-finished\t{}\t{:?}", target_id, direction),
        Event::TransferFailed { target_id, reason } => format!("transfer-failed\t{}\t{}", target_id, reason),
        Event::HashingProgress { filename, bytes_done, bytes_total } => {
            format!("hashing-progress\t{}\t{}\t{}", filename, bytes_done, bytes_total)
        }
        Event::HashingFinished { filename, tth } => format!(
            "hashing-finished\t{}\t{}",
            filename,
            tth.map(|t| t.to_base32()).unwrap_or_default()
        ),
        Event::ShareScanFinished { files_added, files_removed } => {
            format!("share-scan-finished\t{}\t{}", files_added, files_removed)
        }
        Event::StatusMessage { code, text } => format!("status-message\t{:?}\t{}", code, text),
    }
}
