//! Hub state machine (§4.5): one [`Hub`] per configured hub
//! connection, driven by lines read off its socket and by the
//! reactor's tick timer. State transitions and reconnect bookkeeping
//! are grounded on the traversal in `original_source/sphubd/hub.c`;
//! the quadratic reconnect backoff and kick-counter policy match it
//! exactly.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use shakes_core::{nmdc, Nick};
use tracing::{debug, info, warn};

use crate::notify::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubState {
    Disconnected,
    Connecting,
    WaitingForLock,
    WaitingForHello,
    LoggedIn,
}

#[derive(Clone, Debug, Default)]
pub struct UserInfo {
    pub is_op: bool,
    pub share_size: u64,
    pub description: String,
    pub tag: String,
    pub connection: String,
    pub email: String,
}

const MYINFO_COALESCE: Duration = Duration::from_secs(4);
const CHAT_RING_CAPACITY: usize = 200;
/// `attempt^2 * 5` seconds, per §4.5.
const RECONNECT_BASE_SECS: u64 = 5;
/// A hub that kicks us this many times within one reconnect cycle is
/// treated as actively hostile and backed off harder (matches the
/// original's kick-counter escalation).
const KICK_ESCALATION_THRESHOLD: u32 = 3;

pub struct Hub {
    pub id: u64,
    pub address: String,
    pub state: HubState,
    pub nick: Nick,
    pub password: Option<String>,
    pub hub_name: String,
    pub roster: HashMap<Nick, UserInfo>,
    pub chat: VecDeque<String>,
    pub reconnect_attempts: u32,
    pub kick_count: u32,
    pub next_reconnect_at: Option<Instant>,
    pub pending_myinfo: bool,
    pub myinfo_deadline: Option<Instant>,
    my_lock: Option<String>,
}

impl Hub {
    pub fn new(id: u64, address: String, nick: Nick, password: Option<String>) -> Self {
        Self {
            id,
            address,
            state: HubState::Disconnected,
            nick,
            password,
            hub_name: String::new(),
            roster: HashMap::new(),
            chat: VecDeque::with_capacity(CHAT_RING_CAPACITY),
            reconnect_attempts: 0,
            kick_count: 0,
            next_reconnect_at: None,
            pending_myinfo: false,
            myinfo_deadline: None,
            my_lock: None,
        }
    }

    /// Seconds to wait before the next reconnect attempt, per §4.5's
    /// quadratic backoff: `attempt^2 * 5`. A hub that's kicked us
    /// repeatedly escalates to the next attempt bracket immediately.
    pub fn reconnect_delay(&self) -> Duration {
        let mut attempt = self.reconnect_attempts.max(1);
        if self.kick_count >= KICK_ESCALATION_THRESHOLD {
            attempt += 1;
        }
        Duration::from_secs((attempt as u64).pow(2) * RECONNECT_BASE_SECS)
    }

    pub fn on_connect_attempt(&mut self) {
        self.state = HubState::Connecting;
        self.reconnect_attempts += 1;
    }

    pub fn on_connected(&mut self) {
        self.state = HubState::WaitingForLock;
    }

    pub fn on_disconnected(&mut self, reason: &str) -> Event {
        self.state = HubState::Disconnected;
        self.roster.clear();
        self.next_reconnect_at = Some(Instant::now() + self.reconnect_delay());
        Event::HubDisconnected { hub_id: self.id, reason: reason.to_string() }
    }

    pub fn on_kicked(&mut self) {
        self.kick_count += 1;
    }

    pub fn reset_kick_count_on_clean_session(&mut self) {
        self.kick_count = 0;
        self.reconnect_attempts = 0;
    }

    /// Process one line from the hub; returns outbound lines to send
    /// back and any events to publish.
    pub fn handle_line(&mut self, line: &str) -> (Vec<String>, Vec<Event>) {
        let mut out = Vec::new();
        let mut events = Vec::new();

        if let Some(lock) = line.strip_prefix("$Lock ") {
            let lock = lock.split(' ').next().unwrap_or(lock);
            self.my_lock = Some(lock.to_string());
            match nmdc::lock_to_key(lock) {
                Ok(key) => {
                    out.push(format!("$Key {}|", key));
                    out.push(format!("$ValidateNick {}|", self.nick.as_str()));
                    self.state = HubState::WaitingForHello;
                }
                Err(e) => warn!("bad lock from hub {}: {}", self.id, e),
            }
        } else if line.starts_with("$GetPass") {
            if let Some(password) = &self.password {
                out.push(format!("$MyPass {}|", password));
            }
        } else if line.starts_with("$Hello ") {
            if self.state == HubState::WaitingForHello {
                self.state = HubState::LoggedIn;
                self.pending_myinfo = true;
                self.myinfo_deadline = Some(Instant::now() + MYINFO_COALESCE);
                events.push(Event::HubConnected { hub_id: self.id });
            }
        } else if let Some(name) = line.strip_prefix("$HubName ") {
            self.hub_name = name.to_string();
        } else if let Some(rest) = line.strip_prefix("$MyINFO $ALL ") {
            if let Some((nick_str, _)) = rest.split_once(' ') {
                let nick = Nick::new(nmdc::unescape(nick_str));
                let info = self.roster.entry(nick.clone()).or_default();
                if let Some(share_str) = rest.rsplit('$').next() {
                    if let Ok(size) = share_str.trim().parse::<u64>() {
                        info.share_size = size;
                    }
                }
                if !self.roster.contains_key(&nick) {
                    events.push(Event::UserJoin { hub_id: self.id, nick });
                }
            }
        } else if let Some(rest) = line.strip_prefix("$Quit ") {
            let nick = Nick::new(nmdc::unescape(rest));
            self.roster.remove(&nick);
            events.push(Event::UserQuit { hub_id: self.id, nick });
        } else if let Some(rest) = line.strip_prefix("$ForceMove ") {
            events.push(Event::HubRedirect { hub_id: self.id, target: rest.to_string() });
        } else if let Some(rest) = line.strip_prefix("$To: ") {
            if let Some((_, after_from)) = rest.split_once("From: ") {
                if let Some((from_nick, msg)) = after_from.split_once("$<") {
                    let _ = from_nick;
                    if let Some((_, text)) = msg.split_once("> ") {
                        events.push(Event::PrivateMessage {
                            hub_id: self.id,
                            from: Nick::new(nmdc::unescape(msg.split('>').next().unwrap_or(""))),
                            text: nmdc::unescape(text),
                        });
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix('<') {
            if let Some((nick, text)) = rest.split_once("> ") {
                self.push_chat(line);
                events.push(Event::ChatMessage {
                    hub_id: self.id,
                    nick: Nick::new(nmdc::unescape(nick)),
                    text: nmdc::unescape(text),
                });
            }
        } else if line.starts_with("$ValidateDenide") || line.starts_with("$HubIsFull") {
            events.push(Event::StatusMessage {
                code: shakes_core::StatusCode::ProtocolViolation,
                text: line.to_string(),
            });
        }

        (out, events)
    }

    fn push_chat(&mut self, line: &str) {
        if self.chat.len() >= CHAT_RING_CAPACITY {
            self.chat.pop_front();
        }
        self.chat.push_back(line.to_string());
    }

    /// Called on every reactor tick; emits the coalesced `$MyINFO`
    /// once the 4s window has elapsed since it was first marked dirty.
    pub fn take_due_myinfo(&mut self, myinfo_line: &str) -> Option<String> {
        let deadline = self.myinfo_deadline?;
        if Instant::now() < deadline {
            return None;
        }
        self.pending_myinfo = false;
        self.myinfo_deadline = None;
        Some(myinfo_line.to_string())
    }

    pub fn mark_myinfo_dirty(&mut self) {
        if !self.pending_myinfo {
            self.pending_myinfo = true;
            self.myinfo_deadline = Some(Instant::now() + MYINFO_COALESCE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Hub {
        Hub::new(1, "hub.example:411".into(), Nick::new("me"), None)
    }

    #[test]
    fn lock_triggers_key_and_validate_nick() {
        let mut h = hub();
        let (out, _events) = h.handle_line("$Lock EXTENDEDPROTOCOL_ABCDEFGHIJ Pk=test|");
        assert!(out[0].starts_with("$Key "));
        assert!(out[1].starts_with("$ValidateNick me"));
        assert_eq!(h.state, HubState::WaitingForHello);
    }

    #[test]
    fn hello_after_lock_marks_logged_in_and_schedules_myinfo() {
        let mut h = hub();
        h.handle_line("$Lock EXTENDEDPROTOCOL_ABCDEFGHIJ Pk=test|");
        let (_out, events) = h.handle_line("$Hello me|");
        assert_eq!(h.state, HubState::LoggedIn);
        assert!(h.pending_myinfo);
        assert!(matches!(events[0], Event::HubConnected { hub_id: 1 }));
    }

    #[test]
    fn quadratic_backoff_grows_with_attempts() {
        let mut h = hub();
        h.reconnect_attempts = 1;
        assert_eq!(h.reconnect_delay(), Duration::from_secs(5));
        h.reconnect_attempts = 3;
        assert_eq!(h.reconnect_delay(), Duration::from_secs(45));
    }

    #[test]
    fn kick_escalation_bumps_the_next_bracket() {
        let mut h = hub();
        h.reconnect_attempts = 2;
        let normal = h.reconnect_delay();
        h.kick_count = KICK_ESCALATION_THRESHOLD;
        let escalated = h.reconnect_delay();
        assert!(escalated > normal);
    }

    #[test]
    fn myinfo_join_and_quit_update_roster() {
        let mut h = hub();
        h.handle_line("$Lock EXTENDEDPROTOCOL_ABCDEFGHIJ Pk=test|");
        h.handle_line("$Hello me|");
        let (_out, events) = h.handle_line("$MyINFO $ALL alice <tag>$ $LAN(5)$$12345$");
        assert!(matches!(&events[0], Event::UserJoin { nick, .. } if nick.as_str() == "alice"));
        assert!(h.roster.contains_key(&Nick::new("alice")));

        let (_out, events) = h.handle_line("$Quit alice");
        assert!(matches!(&events[0], Event::UserQuit { nick, .. } if nick.as_str() == "alice"));
        assert!(!h.roster.contains_key(&Nick::new("alice")));
    }

    #[test]
    fn chat_line_is_escaped_and_ring_bounded() {
        let mut h = hub();
        let (_out, events) = h.handle_line("<alice> hello&#124;world");
        assert!(matches!(&events[0], Event::ChatMessage { text, .. } if text == "hello|world"));
        assert_eq!(h.chat.len(), 1);
    }

    #[test]
    fn disconnect_schedules_a_reconnect_and_clears_roster() {
        let mut h = hub();
        h.handle_line("$MyINFO $ALL alice <tag>$ $LAN(5)$$12345$");
        let event = h.on_disconnected("connection reset");
        assert!(matches!(event, Event::HubDisconnected { hub_id: 1, .. }));
        assert!(h.roster.is_empty());
        assert!(h.next_reconnect_at.is_some());
    }
}
