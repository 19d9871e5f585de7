//! Share-filename Bloom filter (§2, §4.1): lets the incoming-search
//! matcher cheaply prove a share has no file matching a query word
//! without walking every indexed file. Grounded on
//! `original_source/sphubd/share.c`'s `bloom_create(32768)` and
//! `share_scan.c`/`share_search.c`'s add-on-hash / check-before-scan
//! usage; reauthored as a small fixed-size bitset with two independent
//! hashes rather than ported bit-for-bit, since the original's hash
//! functions aren't part of the filtered source set.

const BLOOM_BITS: usize = 32768;
const HASH_COUNT: usize = 4;

/// Split a filename (or search pattern) into the lowercase word tokens
/// the filter and the linear matcher both key on.
pub fn split_words(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn positions(word: &str) -> [usize; HASH_COUNT] {
    let folded = word.to_lowercase();
    let h1 = fnv1a(folded.as_bytes(), 0xcbf2_9ce4_8422_2325);
    let h2 = fnv1a(folded.as_bytes(), 0x8422_2325_cbf2_9ce4).max(1);
    std::array::from_fn(|i| (h1.wrapping_add((i as u64).wrapping_mul(h2)) as usize) % BLOOM_BITS)
}

pub struct ShareBloom {
    bits: Vec<bool>,
    set_bits: usize,
}

impl ShareBloom {
    pub fn new() -> Self {
        Self { bits: vec![false; BLOOM_BITS], set_bits: 0 }
    }

    fn add_word(&mut self, word: &str) {
        if word.is_empty() {
            return;
        }
        for pos in positions(word) {
            if !self.bits[pos] {
                self.bits[pos] = true;
                self.set_bits += 1;
            }
        }
    }

    /// Index every word of a share file's basename, matching the
    /// tokenization the search matcher uses (§4.7's "casefolded
    /// composed-UTF-8 words must appear as substrings").
    pub fn add_filename(&mut self, filename: &str) {
        for word in split_words(filename) {
            self.add_word(&word);
        }
    }

    fn may_contain_word(&self, word: &str) -> bool {
        positions(word).iter().all(|&pos| self.bits[pos])
    }

    /// `false` is a proof that no file in this share can match every
    /// one of `query_words`; `true` means the linear scan must still
    /// run to confirm (the filter never false-negatives, only
    /// false-positives).
    pub fn may_match(&self, query_words: &[String]) -> bool {
        query_words.iter().all(|w| self.may_contain_word(w))
    }

    pub fn filled_percent(&self) -> f64 {
        self.set_bits as f64 / BLOOM_BITS as f64 * 100.0
    }
}

impl Default for ShareBloom {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_filename_words_are_found() {
        let mut bloom = ShareBloom::new();
        bloom.add_filename("Some.Movie.2024.mkv");
        assert!(bloom.may_contain_word("movie"));
        assert!(bloom.may_contain_word("2024"));
    }

    #[test]
    fn unrelated_word_is_very_likely_absent() {
        let mut bloom = ShareBloom::new();
        bloom.add_filename("vacation_photo.jpg");
        assert!(!bloom.may_contain_word("xenomorphic"));
    }

    #[test]
    fn may_match_requires_every_word() {
        let mut bloom = ShareBloom::new();
        bloom.add_filename("ubuntu-24.04-desktop.iso");
        assert!(bloom.may_match(&["ubuntu".to_string(), "desktop".to_string()]));
        assert!(!bloom.may_match(&["ubuntu".to_string(), "xenomorphic".to_string()]));
    }

    #[test]
    fn filled_percent_grows_with_inserts() {
        let mut bloom = ShareBloom::new();
        assert_eq!(bloom.filled_percent(), 0.0);
        bloom.add_filename("a.bin");
        assert!(bloom.filled_percent() > 0.0);
    }

    #[test]
    fn split_words_lowercases_and_drops_punctuation() {
        assert_eq!(split_words("Foo-Bar_Baz.TXT"), vec!["foo", "bar", "baz", "txt"]);
    }
}
