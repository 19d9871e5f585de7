//! Identifiers shared across the daemon: content hashes, composite
//! inodes, virtual roots and nicks (§3).

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of a Tiger Tree Hash root hash.
pub const TTH_RAW_LEN: usize = 24;

/// Length in characters of the base-32 encoded form (§3: "39-character
/// base-32 hash").
pub const TTH_ENCODED_LEN: usize = 39;

/// Content identity: a Tiger Tree Hash root, base32-encoded.
///
/// Equality and hashing operate on the raw 24 bytes; the base32 form is
/// only materialized for wire/display use (`$Search ... TTH:<hash>`,
/// filelist XML, control-channel events).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tth([u8; TTH_RAW_LEN]);

impl Tth {
    pub const fn from_raw(bytes: [u8; TTH_RAW_LEN]) -> Self {
        Self(bytes)
    }

    pub fn raw(&self) -> &[u8; TTH_RAW_LEN] {
        &self.0
    }

    /// Parse a 39-character base32 TTH string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != TTH_ENCODED_LEN {
            return None;
        }
        let upper = s.to_ascii_uppercase();
        let decoded = BASE32_NOPAD.decode(upper.as_bytes()).ok()?;
        let bytes: [u8; TTH_RAW_LEN] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }
}

impl fmt::Display for Tth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

impl fmt::Debug for Tth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tth({})", self.to_base32())
    }
}

/// A share file's composite identity, used to detect on-disk changes
/// between scans without re-hashing: high 32 bits the file size, low
/// 32 bits the filesystem inode number (§3). Changing either
/// invalidates any previously computed TTH for this slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct CompositeInode(u64);

impl CompositeInode {
    pub fn new(size: u64, fs_inode: u64) -> Self {
        let size32 = size as u32 as u64;
        let inode32 = fs_inode as u32 as u64;
        Self((size32 << 32) | inode32)
    }

    pub fn size_part(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn inode_part(&self) -> u32 {
        self.0 as u32
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CompositeInode {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// A share mountpoint's user-visible label (§3: unique per index,
/// `-N` suffix on collision, `$`/`|` replaced with `_`).
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct VirtualRoot(String);

impl VirtualRoot {
    /// Derive a virtual root label from a directory basename,
    /// sanitizing characters the NMDC wire protocol can't carry.
    pub fn sanitize(basename: &str) -> String {
        basename
            .chars()
            .map(|c| if c == '$' || c == '|' { '_' } else { c })
            .collect()
    }

    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VirtualRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A hub or peer nickname. Newtype so arena keys aren't confused with
/// arbitrary strings.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Nick(String);

impl Nick {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Nick {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Nick {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tth_roundtrips_through_base32() {
        let raw = [7u8; TTH_RAW_LEN];
        let tth = Tth::from_raw(raw);
        let encoded = tth.to_base32();
        assert_eq!(encoded.len(), TTH_ENCODED_LEN);
        let parsed = Tth::parse(&encoded).unwrap();
        assert_eq!(parsed, tth);
    }

    #[test]
    fn tth_parse_rejects_wrong_length() {
        assert!(Tth::parse("TOOSHORT").is_none());
    }

    #[test]
    fn tth_parse_is_case_insensitive() {
        let raw = [200u8; TTH_RAW_LEN];
        let tth = Tth::from_raw(raw);
        let lower = tth.to_base32().to_ascii_lowercase();
        assert_eq!(Tth::parse(&lower).unwrap(), tth);
    }

    #[test]
    fn composite_inode_invalidates_on_size_change() {
        let a = CompositeInode::new(8192, 555);
        let b = CompositeInode::new(8193, 555);
        assert_ne!(a, b);
        assert_eq!(a.inode_part(), b.inode_part());
        assert_ne!(a.size_part(), b.size_part());
    }

    #[test]
    fn virtual_root_sanitizes_dollar_and_pipe() {
        assert_eq!(VirtualRoot::sanitize("a$b|c"), "a_b_c");
        assert_eq!(VirtualRoot::sanitize("normal"), "normal");
    }
}
