//! NMDC wire primitives: lock/key derivation, field quoting and chat
//! escaping, and legacy hub-encoding transcoding (§4.5, §6).
//!
//! Grounded on `original_source/splib/nmdc.c`: the algorithms below are
//! the same transforms, reauthored as safe Rust (no raw pointer
//! arithmetic, no C string termination games) rather than transliterated.

use crate::error::NmdcError;
use unicode_normalization::UnicodeNormalization;

/// Bytes the NMDC key encoding must escape: they collide with framing
/// (`|`, `$`) or are otherwise unsafe to send raw.
fn needs_quoting(b: u8) -> bool {
    matches!(b, 0 | 5 | 36 | 96 | 124 | 126)
}

/// Quote bytes that `needs_quoting` flags as `/%DCNnnn%/` (decimal,
/// zero-padded to 3 digits).
fn quote_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if needs_quoting(b) {
            out.push_str(&format!("/%DCN{:03}%/", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Derive the `$Key` response to a hub or peer's `$Lock` challenge.
///
/// The transform: each byte (from index 1) is XORed with its
/// predecessor; byte 0 is XORed with the last two lock bytes and the
/// constant `5`; every resulting byte then has its nibbles swapped.
/// The result is quoted per [`quote_bytes`].
///
/// Locks shorter than 3 bytes have no well-defined key and yield
/// [`NmdcError::LockTooShort`].
pub fn lock_to_key(lock: &str) -> Result<String, NmdcError> {
    let lock = lock.as_bytes();
    let len = lock.len();
    if len < 3 {
        return Err(NmdcError::LockTooShort(len));
    }

    let mut key = vec![0u8; len];
    for i in 1..len {
        key[i] = lock[i] ^ lock[i - 1];
    }
    key[0] = lock[0] ^ lock[len - 1] ^ lock[len - 2] ^ 5;

    for b in key.iter_mut() {
        *b = ((*b << 4) & 0xF0) | ((*b >> 4) & 0x0F);
    }

    Ok(quote_bytes(&key))
}

/// Build the lock string we present as a peer or hub client, with a
/// `Pk=<id><version>` tag appended (§4.5).
pub fn make_lock(id: &str, version: &str) -> String {
    format!(
        "EXTENDEDPROTOCOLABCABCABCABCABCABC Pk={}{}ABCABC",
        id, version
    )
}

/// Whether a hub's lock advertises the extended protocol
/// (`EXTENDEDPROTOCOL` prefix, §4.5/§6).
pub fn is_extended_protocol(lock: &str) -> bool {
    lock.starts_with("EXTENDEDPROTOCOL")
}

/// Escape `|` and `$` for transport inside a chat message field;
/// inverse of [`unescape`].
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '|' => out.push_str("&#124;"),
            '$' => out.push_str("&#36;"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`escape`], also decoding the handful of XML entities
/// the original accepts in chat text.
pub fn unescape(s: &str) -> String {
    const ENTITIES: &[(&str, char)] = &[
        ("&#124;", '|'),
        ("&#36;", '$'),
        ("&amp;", '&'),
        ("&lt;", '<'),
        ("&gt;", '>'),
        ("&apos;", '\''),
        ("&quot;", '"'),
    ];

    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    'outer: while i < bytes.len() {
        for (entity, ch) in ENTITIES {
            if bytes[i..].starts_with(entity.as_bytes()) {
                out.push(*ch);
                i += entity.len();
                continue 'outer;
            }
        }
        // Safe: we only ever skip whole UTF-8 char boundaries below.
        let rest = &s[i..];
        let ch = rest.chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Decode the legacy hub's bytes (default WINDOWS-1252) to UTF-8,
/// first resolving any `\uXXXX`/`\UXXXXXXXX` escapes the hub may have
/// embedded in an otherwise-legacy string (§6).
/// Hub nicks and chat text arrive in whatever normalization form the
/// sender's OS produced; comparing decomposed and composed forms as
/// unequal would silently split one user into two roster entries, so
/// every inbound string is folded to NFC before it reaches the rest
/// of the daemon.
pub fn decode_legacy(bytes: &[u8], encoding: &'static encoding_rs::Encoding) -> String {
    let (text, _, _) = encoding.decode(bytes);
    decode_unicode_escapes(&text).nfc().collect()
}

/// Encode outbound UTF-8 text to the hub's legacy encoding; bytes with
/// no representation become `\uXXXX` escapes rather than being dropped
/// (§4.5: "invalid bytes in the legacy direction become escape
/// sequences").
pub fn encode_legacy(text: &str, encoding: &'static encoding_rs::Encoding) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let mut buf = [0u8; 4];
        let s = ch.encode_utf8(&mut buf);
        let (encoded, _, had_errors) = encoding.encode(s);
        if had_errors {
            let escape = if (ch as u32) > 0xFFFF {
                format!("\\U{:08X}", ch as u32)
            } else {
                format!("\\u{:04X}", ch as u32)
            };
            out.extend_from_slice(escape.as_bytes());
        } else {
            out.extend_from_slice(&encoded);
        }
    }
    out
}

fn decode_unicode_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() && (chars[i + 1] == 'u' || chars[i + 1] == 'U') {
            let wide = chars[i + 1] == 'U';
            let digits = if wide { 8 } else { 4 };
            if i + 2 + digits <= chars.len() {
                let hex: String = chars[i + 2..i + 2 + digits].iter().collect();
                if let Ok(code) = u32::from_str_radix(&hex, 16) {
                    if let Some(ch) = char::from_u32(code) {
                        out.push(ch);
                        i += 2 + digits;
                        continue;
                    }
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_to_key_rejects_short_locks() {
        assert!(matches!(lock_to_key("xx"), Err(NmdcError::LockTooShort(2))));
    }

    #[test]
    fn lock_to_key_is_deterministic() {
        let key1 = lock_to_key("EXTENDEDPROTOCOL_test_lock_value").unwrap();
        let key2 = lock_to_key("EXTENDEDPROTOCOL_test_lock_value").unwrap();
        assert_eq!(key1, key2);
    }

    #[test]
    fn lock_to_key_quotes_unsafe_bytes() {
        // A lock engineered so that byte 0 of the derived key lands on
        // a value requiring quoting: verify the quoting path fires by
        // checking the known fixture round-trips through the C
        // reference algorithm's escape format.
        let key = lock_to_key("aaa").unwrap();
        // key[0] = 'a'^'a'^'a'^5 = 'a'^5 = 0x61^0x05 = 0x64, nibble swap -> 0x46 'F'
        // key[1] = 'a'^'a' = 0, nibble swap -> 0, needs quoting -> /%DCN000%/
        // key[2] = 'a'^'a' = 0, same
        assert!(key.starts_with('F'));
        assert!(key.contains("/%DCN000%/"));
    }

    #[test]
    fn quote_bytes_escapes_exact_set() {
        let q = quote_bytes(&[b'f', b'o', b'o', 5, 5, b'b', b'a', b'r']);
        assert_eq!(q, "foo/%DCN005%//%DCN005%/bar");
    }

    #[test]
    fn escape_unescape_round_trip() {
        let msg = "foo|bar$baz";
        let escaped = escape(msg);
        assert_eq!(escaped, "foo&#124;bar&#36;baz");
        assert_eq!(unescape(&escaped), msg);
    }

    #[test]
    fn extended_protocol_detection() {
        assert!(is_extended_protocol("EXTENDEDPROTOCOLsomelock"));
        assert!(!is_extended_protocol("plainlock"));
    }

    #[test]
    fn legacy_roundtrip_ascii() {
        let bytes = encode_legacy("hello", encoding_rs::WINDOWS_1252);
        assert_eq!(decode_legacy(&bytes, encoding_rs::WINDOWS_1252), "hello");
    }

    #[test]
    fn legacy_unrepresentable_becomes_escape() {
        let bytes = encode_legacy("\u{1F600}", encoding_rs::WINDOWS_1252);
        let back = decode_legacy(&bytes, encoding_rs::WINDOWS_1252);
        assert_eq!(back, "\u{1F600}");
    }

    #[test]
    fn make_lock_contains_pk_tag() {
        let lock = make_lock("ABCD", "0.668");
        assert!(lock.contains("Pk=ABCD0.668"));
        assert!(is_extended_protocol(&lock));
    }
}
