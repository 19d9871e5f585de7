//! Peer connection state machine (§4.6): the
//! `MyNick -> Lock -> Direction -> Key -> Ready -> Request -> Busy`
//! traversal, capability negotiation, download request preference,
//! resume policy and transfer byte accounting. Grounded on
//! `original_source/sphubd/client.c`, `client_download.c` and
//! `client_upload.c`.

use rand::Rng;
use shakes_core::{nmdc, Nick, Tth};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    WaitingForMyNick,
    WaitingForLock,
    WaitingForDirection,
    WaitingForKey,
    Ready,
    Requesting,
    Busy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// How to establish the actual TCP connection for a download once a
/// source is picked (§4.6, §9 Open Question). A passive local session
/// asks the remote to connect to us; otherwise we connect out. Two
/// passive ends can never complete a connection, so that combination
/// fails fast with a status event instead of hanging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectMethod {
    WeConnect,
    AskRemoteToConnect,
    BothPassive,
}

pub fn decide_connect_method(we_are_passive: bool, remote_is_passive: bool) -> ConnectMethod {
    match (we_are_passive, remote_is_passive) {
        (true, true) => ConnectMethod::BothPassive,
        (true, false) => ConnectMethod::AskRemoteToConnect,
        (false, _) => ConnectMethod::WeConnect,
    }
}

/// `$Supports` capability flags (Data Model §3's peer connection
/// tuple). Parsed off the lock exchange; drives `build_request`'s
/// preference order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerCapabilities {
    pub xmlbzlist: bool,
    pub adcget: bool,
    pub tthl: bool,
    pub tthf: bool,
}

impl PeerCapabilities {
    pub fn parse(supports: &str) -> Self {
        let mut caps = Self::default();
        for token in supports.trim_end_matches('|').split_whitespace() {
            match token {
                "XmlBZList" => caps.xmlbzlist = true,
                "ADCGet" => caps.adcget = true,
                "TTHL" => caps.tthl = true,
                "TTHF" => caps.tthf = true,
                _ => {}
            }
        }
        caps
    }
}

/// What to ask for, in preference order (§4.6): a download request
/// names a TTH when the target is known, falling back to plain
/// filename matching for sources discovered by name-only search.
#[derive(Clone, Debug)]
pub enum RequestSpec {
    ByTth { tth: Tth, filename: String },
    ByFilename { filename: String },
}

#[derive(Default, Clone, Copy, Debug)]
pub struct ByteAccounting {
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub resume_offset: u64,
}

impl ByteAccounting {
    pub fn remaining(&self) -> u64 {
        self.bytes_total.saturating_sub(self.resume_offset + self.bytes_transferred)
    }

    pub fn is_complete(&self) -> bool {
        self.resume_offset + self.bytes_transferred >= self.bytes_total
    }
}

/// Resolve transfer direction once both challenge numbers are known
/// (§4.6): an explicit, unambiguous word from the remote is honored
/// directly; otherwise the higher challenge number downloads, and a
/// tie goes to whichever side dialed out (the initiator uploads).
pub fn resolve_direction(
    our_desire: TransferDirection,
    remote_wants_upload: bool,
    remote_wants_download: bool,
    our_challenge: u32,
    remote_challenge: u32,
    we_initiated: bool,
) -> TransferDirection {
    if remote_wants_upload && our_desire == TransferDirection::Download {
        return TransferDirection::Download;
    }
    if remote_wants_download && our_desire == TransferDirection::Upload {
        return TransferDirection::Upload;
    }
    match our_challenge.cmp(&remote_challenge) {
        std::cmp::Ordering::Greater => TransferDirection::Download,
        std::cmp::Ordering::Less => TransferDirection::Upload,
        std::cmp::Ordering::Equal => {
            if we_initiated {
                TransferDirection::Upload
            } else {
                TransferDirection::Download
            }
        }
    }
}

pub struct Peer {
    pub state: PeerState,
    pub remote_nick: Option<Nick>,
    pub local_nick: Nick,
    pub remote_lock: Option<String>,
    /// Whether we dialed out (we sent `$MyNick` first) or they did.
    pub we_connected: bool,
    pub direction: Option<TransferDirection>,
    pub accounting: ByteAccounting,
    pub hub_id: u64,
    pub capabilities: PeerCapabilities,
    /// What we'd prefer this connection's direction to be, declared in
    /// our own `$Direction` word: `Download` when it exists because we
    /// have something queued from this peer, `Upload` otherwise.
    pub desired_direction: TransferDirection,
    our_challenge: u32,
    remote_challenge: Option<u32>,
}

impl Peer {
    pub fn new(local_nick: Nick, hub_id: u64, we_connected: bool, desired_direction: TransferDirection) -> Self {
        Self {
            state: if we_connected { PeerState::WaitingForLock } else { PeerState::WaitingForMyNick },
            remote_nick: None,
            local_nick,
            remote_lock: None,
            we_connected,
            direction: None,
            accounting: ByteAccounting::default(),
            hub_id,
            capabilities: PeerCapabilities::default(),
            desired_direction,
            our_challenge: rand::thread_rng().gen_range(1..1_000_000),
            remote_challenge: None,
        }
    }

    pub fn handle_line(&mut self, line: &str) -> Vec<String> {
        let mut out = Vec::new();

        if self.we_connected && self.state == PeerState::Connecting {
            out.push(format!("$MyNick {}|", self.local_nick.as_str()));
            self.state = PeerState::WaitingForLock;
        }

        if let Some(nick) = line.strip_prefix("$MyNick ") {
            self.remote_nick = Some(Nick::new(nick.trim_end_matches('|')));
            if !self.we_connected {
                out.push(format!("$MyNick {}|", self.local_nick.as_str()));
                self.state = PeerState::WaitingForLock;
            }
        } else if let Some(lock_and_rest) = line.strip_prefix("$Lock ") {
            let (lock_part, supports_part) = match lock_and_rest.split_once("$Supports ") {
                Some((l, s)) => (l, Some(s)),
                None => (lock_and_rest, None),
            };
            if let Some(supports) = supports_part {
                self.capabilities = PeerCapabilities::parse(supports);
            }
            let lock_val = lock_part.split(' ').next().unwrap_or(lock_part);
            self.remote_lock = Some(lock_val.to_string());
            let our_lock = nmdc::make_lock("SHAKESRS", "0100");
            out.push(format!("$Lock {}|", our_lock));
            out.push("$Supports ADCGet TTHF TTHL XmlBZList|".to_string());
            if let Ok(key) = nmdc::lock_to_key(lock_val) {
                let direction_word =
                    if self.desired_direction == TransferDirection::Download { "Download" } else { "Upload" };
                out.push(format!("$Direction {} {}|", direction_word, self.our_challenge));
                out.push(format!("$Key {}|", key));
            }
            self.state = PeerState::WaitingForDirection;
        } else if let Some(rest) = line.strip_prefix("$Supports ") {
            self.capabilities = PeerCapabilities::parse(rest);
        } else if let Some(rest) = line.strip_prefix("$Direction ") {
            let rest = rest.trim_end_matches('|');
            let mut parts = rest.split(' ');
            let remote_word = parts.next().unwrap_or("");
            let remote_challenge: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            self.remote_challenge = Some(remote_challenge);
            self.direction = Some(resolve_direction(
                self.desired_direction,
                remote_word == "Upload",
                remote_word == "Download",
                self.our_challenge,
                remote_challenge,
                self.we_connected,
            ));
            self.state = PeerState::WaitingForKey;
        } else if line.starts_with("$Key ") {
            self.state = PeerState::Ready;
        }

        out
    }

    /// Build the download request line for `spec`, preferring
    /// `$ADCGET ... TTH/<hash>` when both `adcget` and `tthf` are
    /// supported, then `$ADCGET` by path, then `$UGetBlock`, and
    /// finally the legacy `$Get`. `length` of `0` asks for the rest of
    /// the file.
    pub fn build_request(&mut self, spec: &RequestSpec, existing_partial_bytes: u64, length: u64) -> String {
        self.state = PeerState::Requesting;
        self.accounting.resume_offset = existing_partial_bytes;
        let offset = existing_partial_bytes;

        match spec {
            RequestSpec::ByTth { tth, filename } if self.capabilities.adcget && self.capabilities.tthf => {
                format!("$ADCGET file TTH/{} {} {}|", tth.to_base32(), offset, length)
            }
            RequestSpec::ByTth { filename, .. } | RequestSpec::ByFilename { filename } => {
                if self.capabilities.adcget {
                    format!("$ADCGET file {} {} {}|", nmdc::escape(filename), offset, length)
                } else if self.capabilities.xmlbzlist {
                    format!("$UGetBlock {} {} {}|", offset, length, nmdc::escape(filename))
                } else {
                    format!("$Get {}${}|", nmdc::escape(filename), offset + 1)
                }
            }
        }
    }

    pub fn begin_transfer(&mut self, total_size: u64) {
        self.state = PeerState::Busy;
        self.accounting.bytes_total = total_size;
        self.accounting.bytes_transferred = 0;
    }

    pub fn record_bytes(&mut self, n: u64) {
        self.accounting.bytes_transferred += n;
    }

    pub fn finish_transfer(&mut self) {
        self.state = PeerState::Ready;
    }

    /// Whether we should accept an upload request for `requested_size`
    /// given `free_slots`. A slot-less peer is still served if the
    /// file is small enough to count as a "free" mini-slot transfer;
    /// the caller supplies the threshold from configuration.
    pub fn grant_slot(free_slots: u32, requested_size: u64, mini_slot_threshold: u64) -> bool {
        free_slots > 0 || requested_size <= mini_slot_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(we_connected: bool, desired: TransferDirection) -> Peer {
        Peer::new(Nick::new("me"), 1, we_connected, desired)
    }

    #[test]
    fn outbound_connection_starts_with_mynick() {
        let mut p = peer(true, TransferDirection::Download);
        p.state = PeerState::Connecting;
        let out = p.handle_line("");
        assert_eq!(out[0], "$MyNick me|");
    }

    #[test]
    fn lock_response_includes_supports_key_and_direction() {
        let mut p = peer(false, TransferDirection::Download);
        p.handle_line("$MyNick them|");
        let out = p.handle_line("$Lock EXTENDEDPROTOCOL_ABCDEFGHIJ Pk=test|");
        assert!(out.iter().any(|l| l.starts_with("$Lock ")));
        assert!(out.iter().any(|l| l.starts_with("$Supports ")));
        assert!(out.iter().any(|l| l.starts_with("$Direction Download ")));
        assert!(out.iter().any(|l| l.starts_with("$Key ")));
        assert_eq!(p.state, PeerState::WaitingForDirection);
    }

    #[test]
    fn lock_line_with_inline_supports_parses_capabilities() {
        let mut p = peer(false, TransferDirection::Download);
        p.handle_line("$MyNick them|");
        p.handle_line("$Lock EXTENDEDPROTOCOL_ABCDEFGHIJ Pk=test$Supports ADCGet TTHF|");
        assert!(p.capabilities.adcget);
        assert!(p.capabilities.tthf);
        assert!(!p.capabilities.xmlbzlist);
    }

    #[test]
    fn separate_supports_line_parses_capabilities() {
        let mut p = peer(false, TransferDirection::Download);
        p.handle_line("$Supports ADCGet XmlBZList|");
        assert!(p.capabilities.adcget);
        assert!(p.capabilities.xmlbzlist);
        assert!(!p.capabilities.tthf);
    }

    #[test]
    fn full_handshake_reaches_ready() {
        let mut p = peer(false, TransferDirection::Upload);
        p.handle_line("$MyNick them|");
        p.handle_line("$Lock EXTENDEDPROTOCOL_ABCDEFGHIJ Pk=test|");
        p.handle_line("$Direction Download 5555|");
        p.handle_line("$Key somekey|");
        assert_eq!(p.state, PeerState::Ready);
    }

    #[test]
    fn explicit_remote_upload_gives_us_the_download() {
        assert_eq!(
            resolve_direction(TransferDirection::Download, true, false, 1, 999_999, false),
            TransferDirection::Download
        );
    }

    #[test]
    fn explicit_remote_download_gives_us_the_upload() {
        assert_eq!(
            resolve_direction(TransferDirection::Upload, false, true, 999_999, 1, false),
            TransferDirection::Upload
        );
    }

    #[test]
    fn ambiguous_case_is_decided_by_challenge_number() {
        assert_eq!(
            resolve_direction(TransferDirection::Download, false, true, 500, 100, false),
            TransferDirection::Download
        );
        assert_eq!(
            resolve_direction(TransferDirection::Download, false, true, 100, 500, false),
            TransferDirection::Upload
        );
    }

    #[test]
    fn tie_break_goes_to_the_initiator_uploading() {
        assert_eq!(
            resolve_direction(TransferDirection::Download, false, true, 42, 42, true),
            TransferDirection::Upload
        );
        assert_eq!(
            resolve_direction(TransferDirection::Download, false, true, 42, 42, false),
            TransferDirection::Download
        );
    }

    #[test]
    fn two_symmetric_peers_agree_on_complementary_directions() {
        // Peer A dials out with challenge 42; peer B accepts with challenge 900.
        let (a_challenge, b_challenge) = (42u32, 900u32);
        let a_direction = resolve_direction(TransferDirection::Download, false, true, a_challenge, b_challenge, true);
        let b_direction = resolve_direction(TransferDirection::Download, false, true, b_challenge, a_challenge, false);
        assert_ne!(a_direction, b_direction);
    }

    #[test]
    fn build_request_uses_partial_bytes_as_resume_offset() {
        let mut p = peer(false, TransferDirection::Download);
        let spec = RequestSpec::ByFilename { filename: "movie.avi".into() };
        let req = p.build_request(&spec, 1024, 0);
        assert_eq!(req, "$Get movie.avi$1025|");
        assert_eq!(p.accounting.resume_offset, 1024);
    }

    #[test]
    fn build_request_prefers_adcget_tth_when_both_capabilities_present() {
        let mut p = peer(false, TransferDirection::Download);
        p.capabilities = PeerCapabilities { adcget: true, tthf: true, ..Default::default() };
        let tth = Tth::from_raw([4; 24]);
        let spec = RequestSpec::ByTth { tth, filename: "movie.avi".into() };
        let req = p.build_request(&spec, 0, 65536);
        assert_eq!(req, format!("$ADCGET file TTH/{} 0 65536|", tth.to_base32()));
    }

    #[test]
    fn build_request_falls_back_to_adcget_by_path_without_tthf() {
        let mut p = peer(false, TransferDirection::Download);
        p.capabilities = PeerCapabilities { adcget: true, ..Default::default() };
        let tth = Tth::from_raw([4; 24]);
        let spec = RequestSpec::ByTth { tth, filename: "movie.avi".into() };
        let req = p.build_request(&spec, 0, 0);
        assert_eq!(req, "$ADCGET file movie.avi 0 0|");
    }

    #[test]
    fn build_request_falls_back_to_ugetblock_without_adcget() {
        let mut p = peer(false, TransferDirection::Download);
        p.capabilities = PeerCapabilities { xmlbzlist: true, ..Default::default() };
        let spec = RequestSpec::ByFilename { filename: "movie.avi".into() };
        let req = p.build_request(&spec, 100, 50);
        assert_eq!(req, "$UGetBlock 100 50 movie.avi|");
    }

    #[test]
    fn byte_accounting_tracks_remaining_and_completion() {
        let mut acc = ByteAccounting { bytes_total: 1000, resume_offset: 200, bytes_transferred: 0 };
        assert_eq!(acc.remaining(), 800);
        acc.bytes_transferred = 800;
        assert!(acc.is_complete());
    }

    #[test]
    fn grant_slot_allows_mini_slot_without_free_slots() {
        assert!(!Peer::grant_slot(0, 100_000, 64_000));
        assert!(Peer::grant_slot(0, 32_000, 64_000));
        assert!(Peer::grant_slot(1, 100_000, 64_000));
    }

    #[test]
    fn connect_method_prefers_dialing_out_when_we_are_active() {
        assert_eq!(decide_connect_method(false, false), ConnectMethod::WeConnect);
        assert_eq!(decide_connect_method(false, true), ConnectMethod::WeConnect);
    }

    #[test]
    fn connect_method_asks_remote_when_only_we_are_passive() {
        assert_eq!(decide_connect_method(true, false), ConnectMethod::AskRemoteToConnect);
    }

    #[test]
    fn connect_method_fails_fast_when_both_passive() {
        assert_eq!(decide_connect_method(true, true), ConnectMethod::BothPassive);
    }
}
