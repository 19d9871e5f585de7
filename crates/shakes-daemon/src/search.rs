//! Search dispatcher/listener (§4.4, §4.7): encodes outbound
//! `$Search` requests, parses incoming `$Search`/`$SR` lines, builds
//! our own `$SR` replies, and holds the FIFO of pending requests the
//! auto-search timer drains. Grounded on
//! `original_source/sphubd/search_listener.c`.

use std::collections::VecDeque;

use shakes_core::{nmdc, Nick, Tth};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Any = 1,
    Audio = 2,
    Compressed = 3,
    Document = 4,
    Executable = 5,
    Picture = 6,
    Video = 7,
    Folder = 8,
    Tth = 9,
}

impl DataType {
    pub fn from_wire(n: u32) -> Option<Self> {
        Some(match n {
            1 => DataType::Any,
            2 => DataType::Audio,
            3 => DataType::Compressed,
            4 => DataType::Document,
            5 => DataType::Executable,
            6 => DataType::Picture,
            7 => DataType::Video,
            8 => DataType::Folder,
            9 => DataType::Tth,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct SearchQuery {
    pub pattern: String,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub data_type: DataType,
    pub tth: Option<Tth>,
}

impl SearchQuery {
    pub fn by_name(pattern: impl Into<String>, data_type: DataType) -> Self {
        Self { pattern: pattern.into(), min_size: None, max_size: None, data_type, tth: None }
    }

    pub fn by_tth(tth: Tth) -> Self {
        Self { pattern: String::new(), min_size: None, max_size: None, data_type: DataType::Tth, tth: Some(tth) }
    }
}

/// Where search results should be delivered: actively over UDP to our
/// own listener, or passively relayed by the hub to our nick.
#[derive(Clone, Debug)]
pub enum SearchOrigin {
    Active { ip: std::net::IpAddr, port: u16 },
    Passive { hub_nick: Nick },
}

/// Where *we* should deliver a reply to someone else's search, parsed
/// from the `from` field of their `$Search` line (§4.7).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchReplyTarget {
    Active { ip: std::net::IpAddr, port: u16 },
    Passive { nick: Nick },
}

/// Encode a `$Search` command exactly as the wire expects: a
/// size-restriction triad, then the pattern (words joined by `$`) or a
/// bare `TTH:<hash>` for content-identity searches.
pub fn encode_search(origin: &SearchOrigin, query: &SearchQuery) -> String {
    let from = match origin {
        SearchOrigin::Active { ip, port } => format!("{}:{}", ip, port),
        SearchOrigin::Passive { hub_nick } => format!("Hub:{}", hub_nick.as_str()),
    };

    let (size_restricted, is_max, size) = match (query.min_size, query.max_size) {
        (None, None) => ("F", "T", 0u64),
        (Some(min), None) => ("T", "F", min),
        (None, Some(max)) => ("T", "T", max),
        (Some(min), Some(_max)) => ("T", "F", min),
    };

    let pattern = if let Some(tth) = query.tth {
        format!("TTH:{}", tth.to_base32())
    } else {
        nmdc::escape(&query.pattern.replace(' ', "$"))
    };

    format!(
        "$Search {} {}?{}?{}?{}?{}|",
        from, size_restricted, is_max, size, query.data_type as u32, pattern
    )
}

/// Parse a `$Search` line relayed by a hub (or heard on our active UDP
/// listener) into who to reply to and what they're looking for.
pub fn parse_incoming_search(line: &str) -> Option<(SearchReplyTarget, SearchQuery)> {
    let rest = line.strip_prefix("$Search ")?.trim_end_matches('|');
    let mut parts = rest.splitn(2, ' ');
    let from = parts.next()?;
    let criteria = parts.next()?;

    let target = if let Some(nick) = from.strip_prefix("Hub:") {
        SearchReplyTarget::Passive { nick: Nick::new(nick) }
    } else {
        let (ip_str, port_str) = from.split_once(':')?;
        SearchReplyTarget::Active { ip: ip_str.parse().ok()?, port: port_str.parse().ok()? }
    };

    let mut fields = criteria.splitn(5, '?');
    let size_restricted = fields.next()? == "T";
    let is_max = fields.next()? == "T";
    let size: u64 = fields.next()?.parse().ok()?;
    let data_type_num: u32 = fields.next()?.parse().ok()?;
    let pattern = fields.next()?;

    let data_type = DataType::from_wire(data_type_num)?;
    let (min_size, max_size) =
        if !size_restricted { (None, None) } else if is_max { (None, Some(size)) } else { (Some(size), None) };

    let query = if let Some(tth_str) = pattern.strip_prefix("TTH:") {
        SearchQuery { pattern: String::new(), min_size, max_size, data_type, tth: Tth::parse(tth_str) }
    } else {
        SearchQuery { pattern: nmdc::unescape(&pattern.replace('$', " ")), min_size, max_size, data_type, tth: None }
    };

    Some((target, query))
}

/// Build our own `$SR` reply line to a search that matched a shared
/// file. Appends a `TTH:` segment as an extra `\x05`-separated field
/// when the file is hashed, so the requester's `parse_search_result`
/// can recover it without needing a fifth wire field for size.
pub fn encode_search_result(
    nick: &str,
    virtual_path: &str,
    size: u64,
    free_slots: u32,
    total_slots: u32,
    hub_name: &str,
    hub_address: &str,
    tth: Option<Tth>,
) -> String {
    let mut line = format!(
        "$SR {} {}\u{5}{} {}/{}\u{5}{} ({})",
        nick, virtual_path, size, free_slots, total_slots, hub_name, hub_address
    );
    if let Some(tth) = tth {
        line.push('\u{5}');
        line.push_str(&format!("TTH:{}", tth.to_base32()));
    }
    line.push('|');
    line
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub hub_id: u64,
    pub from: Nick,
    pub virtual_path: String,
    pub size: u64,
    pub free_slots: u32,
    pub total_slots: u32,
    pub tth: Option<Tth>,
}

/// Parse a `$SR` line of the form
/// `$SR <nick> <path>\x05<size> <free>/<total>\x05<hubname> (<hubip:port>)`,
/// with an optional trailing `\x05TTH:<hash>` field.
pub fn parse_search_result(hub_id: u64, line: &str) -> Option<SearchResult> {
    let rest = line.strip_prefix("$SR ")?;
    let mut space_parts = rest.splitn(2, ' ');
    let from = Nick::new(space_parts.next()?);
    let rest = space_parts.next()?;

    let segments: Vec<&str> = rest.split('\u{5}').collect();
    if segments.len() < 2 {
        return None;
    }
    let path = segments[0];
    let (size_str, slots_part) = segments[1].split_once(' ')?;
    let size: u64 = size_str.trim().parse().unwrap_or(0);
    let (free_str, total_str) = slots_part.split_once('/')?;
    let free_slots: u32 = free_str.parse().ok()?;
    let total_slots: u32 = total_str.parse().ok()?;

    let tth = segments[2..].iter().find_map(|seg| seg.strip_prefix("TTH:").and_then(Tth::parse));

    Some(SearchResult { hub_id, from, virtual_path: path.to_string(), size, free_slots, total_slots, tth })
}

#[derive(Clone, Debug)]
pub struct PendingSearch {
    pub hub_id: u64,
    pub origin: SearchOrigin,
    pub query: SearchQuery,
}

/// FIFO of searches waiting for their turn on the per-hub search
/// throttle. An `id` of `-1` (an interactive, user-issued search)
/// jumps the queue by inserting at the head instead of the tail,
/// matching the reference listener's priority rule; every other id
/// (auto-search) appends normally.
#[derive(Default)]
pub struct SearchRequestList {
    queue: VecDeque<PendingSearch>,
}

impl SearchRequestList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: i64, request: PendingSearch) {
        if id == -1 {
            self.queue.push_front(request);
        } else {
            self.queue.push_back(request);
        }
    }

    pub fn pop_next(&mut self) -> Option<PendingSearch> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_passive_search_matches_reference_wire_bytes() {
        let origin = SearchOrigin::Passive { hub_nick: Nick::new("me") };
        let query = SearchQuery::by_name("ample zip", DataType::Audio);
        assert_eq!(encode_search(&origin, &query), "$Search Hub:me F?T?0?1?ample$zip|");
    }

    #[test]
    fn encode_tth_search_uses_tth_prefix() {
        let origin = SearchOrigin::Active { ip: "1.2.3.4".parse().unwrap(), port: 412 };
        let tth = Tth::from_raw([6; 24]);
        let query = SearchQuery::by_tth(tth);
        let encoded = encode_search(&origin, &query);
        assert!(encoded.contains(&format!("TTH:{}", tth.to_base32())));
        assert!(encoded.starts_with("$Search 1.2.3.4:412 "));
    }

    #[test]
    fn parse_incoming_search_matches_scenario_one_bytes() {
        let tth = Tth::parse("IP4CTCABTUE6ZHZLFS2OP5W7EMN3LMFS65H7D2Y").unwrap();
        let line = format!("$Search 1.2.3.4:412 F?T?0?9?TTH:{}|", tth.to_base32());
        let (target, query) = parse_incoming_search(&line).unwrap();
        assert_eq!(target, SearchReplyTarget::Active { ip: "1.2.3.4".parse().unwrap(), port: 412 });
        assert_eq!(query.tth, Some(tth));
    }

    #[test]
    fn parse_incoming_search_handles_passive_name_query() {
        let line = "$Search Hub:bob F?T?0?1?ample$zip|";
        let (target, query) = parse_incoming_search(line).unwrap();
        assert_eq!(target, SearchReplyTarget::Passive { nick: Nick::new("bob") });
        assert_eq!(query.pattern, "ample zip");
        assert_eq!(query.data_type, DataType::Audio);
    }

    #[test]
    fn encode_search_result_round_trips_through_parse() {
        let tth = Tth::from_raw([3; 24]);
        let line = encode_search_result("me", "M\\a.bin", 8192, 2, 3, "SomeHub", "1.2.3.4:411", Some(tth));
        let parsed = parse_search_result(1, &line).unwrap();
        assert_eq!(parsed.from.as_str(), "me");
        assert_eq!(parsed.virtual_path, "M\\a.bin");
        assert_eq!(parsed.size, 8192);
        assert_eq!(parsed.free_slots, 2);
        assert_eq!(parsed.total_slots, 3);
        assert_eq!(parsed.tth, Some(tth));
    }

    #[test]
    fn parse_search_result_extracts_fields() {
        let line = "$SR alice Movies\\foo.avi\u{5}123456 3/5\u{5}SomeHub (1.2.3.4:411)";
        let result = parse_search_result(1, line).unwrap();
        assert_eq!(result.from.as_str(), "alice");
        assert_eq!(result.size, 123456);
        assert_eq!(result.free_slots, 3);
        assert_eq!(result.total_slots, 5);
        assert_eq!(result.tth, None);
    }

    #[test]
    fn request_list_interactive_search_jumps_queue() {
        let mut list = SearchRequestList::new();
        let origin = SearchOrigin::Passive { hub_nick: Nick::new("me") };
        list.push(1, PendingSearch { hub_id: 1, origin: origin.clone(), query: SearchQuery::by_name("auto", DataType::Any) });
        list.push(-1, PendingSearch { hub_id: 1, origin, query: SearchQuery::by_name("interactive", DataType::Any) });
        let first = list.pop_next().unwrap();
        assert_eq!(first.query.pattern, "interactive");
    }

    #[test]
    fn request_list_normal_searches_stay_fifo() {
        let mut list = SearchRequestList::new();
        let origin = SearchOrigin::Passive { hub_nick: Nick::new("me") };
        list.push(1, PendingSearch { hub_id: 1, origin: origin.clone(), query: SearchQuery::by_name("first", DataType::Any) });
        list.push(2, PendingSearch { hub_id: 1, origin, query: SearchQuery::by_name("second", DataType::Any) });
        assert_eq!(list.pop_next().unwrap().query.pattern, "first");
        assert_eq!(list.pop_next().unwrap().query.pattern, "second");
    }
}
