//! ICY metadata records and parsing
//!
//! A metadata block is null-padded text of the form
//! `StreamTitle='Artist - Song';StreamUrl='...';`.

use crate::error::{RelayError, Result};

/// Key/value pairs from one ICY metadata block, in the order they appeared.
///
/// Each new block replaces the previous record as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    entries: Vec<(String, String)>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key, keeping the position of the first occurrence
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `StreamTitle` value, if present and not blank
    pub fn stream_title(&self) -> Option<&str> {
        self.get("StreamTitle")
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Now-playing information split out of a `StreamTitle`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub title: Option<String>,
    pub artist: Option<String>,
}

impl NowPlaying {
    /// Splits on first ` - ` separator: "Artist - Title" → artist="Artist", title="Title".
    /// If no separator found, the whole string becomes the title.
    pub fn from_stream_title(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self {
                title: None,
                artist: None,
            };
        }

        match raw.split_once(" - ") {
            Some((artist, title)) => {
                let artist = artist.trim();
                let title = title.trim();
                Self {
                    title: (!title.is_empty()).then(|| title.to_string()),
                    artist: (!artist.is_empty()).then(|| artist.to_string()),
                }
            }
            None => Self {
                title: Some(raw.to_string()),
                artist: None,
            },
        }
    }

    pub fn from_record(record: &MetadataRecord) -> Option<Self> {
        record.stream_title().map(Self::from_stream_title)
    }
}

/// Parse a raw metadata block (with null padding) into a record.
///
/// Values are delimited by `'` and terminated by the `';` pattern, so a
/// lone apostrophe inside a value is kept. Pairs without `=` or with an empty
/// key are skipped. A block that holds text but no usable pair is a
/// `Framing` error; an all-padding block is an empty record.
pub fn parse_icy_block(raw_block: &[u8]) -> Result<MetadataRecord> {
    let end = raw_block
        .iter()
        .rposition(|&b| b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    let text = String::from_utf8_lossy(&raw_block[..end]);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Ok(MetadataRecord::new());
    }

    let record = parse_pairs(text);
    if record.is_empty() {
        return Err(RelayError::Framing(format!(
            "no key='value' pair in {:?}",
            truncate(text, 64)
        )));
    }
    Ok(record)
}

fn parse_pairs(text: &str) -> MetadataRecord {
    let mut record = MetadataRecord::new();
    let mut rest = text;

    loop {
        rest = rest.trim_start_matches(|c: char| c == ';' || c.is_whitespace() || c == '\0');
        if rest.is_empty() {
            break;
        }

        let Some(eq) = rest.find('=') else {
            break;
        };
        // A ';' before the '=' means the segment up to it is a malformed pair
        if let Some(semi) = rest[..eq].find(';') {
            rest = &rest[semi + 1..];
            continue;
        }

        let key = rest[..eq].trim();
        let after_eq = &rest[eq + 1..];

        let (value, remaining) = if let Some(quoted) = after_eq.strip_prefix('\'') {
            match quoted.find("';") {
                Some(close) => (&quoted[..close], &quoted[close + 2..]),
                // Last pair without the trailing ';'
                None => (quoted.strip_suffix('\'').unwrap_or(quoted), ""),
            }
        } else {
            match after_eq.find(';') {
                Some(semi) => (&after_eq[..semi], &after_eq[semi + 1..]),
                None => (after_eq, ""),
            }
        };

        if !key.is_empty() {
            record.insert(key, value.trim_end_matches('\0'));
        }
        rest = remaining;
    }

    record
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(text: &str) -> Vec<u8> {
        let mut v = text.as_bytes().to_vec();
        v.resize(text.len().div_ceil(16) * 16, 0);
        v
    }

    // --- parse_icy_block ---

    #[test]
    fn parse_standard_block() {
        let r = parse_icy_block(&padded(
            "StreamTitle='Pink Floyd - Comfortably Numb';StreamUrl='';",
        ))
        .unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.get("StreamTitle"), Some("Pink Floyd - Comfortably Numb"));
        assert_eq!(r.get("StreamUrl"), Some(""));
    }

    #[test]
    fn keeps_key_order() {
        let r = parse_icy_block(b"b='2';a='1';c='3';").unwrap();
        let keys: Vec<_> = r.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn apostrophe_inside_value() {
        let r = parse_icy_block(&padded("StreamTitle='Guns N' Roses - Don't Cry';")).unwrap();
        assert_eq!(r.get("StreamTitle"), Some("Guns N' Roses - Don't Cry"));
    }

    #[test]
    fn missing_trailing_semicolon() {
        let r = parse_icy_block(b"StreamTitle='Song'").unwrap();
        assert_eq!(r.get("StreamTitle"), Some("Song"));
    }

    #[test]
    fn skips_malformed_pairs() {
        let r = parse_icy_block(b"garbage;StreamTitle='Song B';='x';").unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r.get("StreamTitle"), Some("Song B"));
    }

    #[test]
    fn unquoted_value_tolerated() {
        let r = parse_icy_block(b"StreamTitle=Plain;Other='x';").unwrap();
        assert_eq!(r.get("StreamTitle"), Some("Plain"));
        assert_eq!(r.get("Other"), Some("x"));
    }

    #[test]
    fn all_padding_is_empty_record() {
        let r = parse_icy_block(&[0u8; 32]).unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn text_without_pairs_is_framing_error() {
        let err = parse_icy_block(&padded("no pairs here")).unwrap_err();
        assert!(matches!(err, RelayError::Framing(_)));
    }

    #[test]
    fn invalid_utf8_is_lossy() {
        let r = parse_icy_block(b"StreamTitle='Mot\xf6rhead';").unwrap();
        assert!(r.get("StreamTitle").unwrap().starts_with("Mot"));
    }

    #[test]
    fn duplicate_key_last_wins() {
        let r = parse_icy_block(b"StreamTitle='A';StreamTitle='B';").unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r.get("StreamTitle"), Some("B"));
    }

    // --- MetadataRecord ---

    #[test]
    fn stream_title_blank_is_none() {
        let mut r = MetadataRecord::new();
        r.insert("StreamTitle", "   ");
        assert_eq!(r.stream_title(), None);
        r.insert("StreamTitle", " Song ");
        assert_eq!(r.stream_title(), Some("Song"));
    }

    #[test]
    fn records_compare_by_full_mapping() {
        let a = parse_icy_block(b"StreamTitle='Song A';").unwrap();
        let b = parse_icy_block(b"StreamTitle='Song A';").unwrap();
        let c = parse_icy_block(b"StreamTitle='Song A';StreamUrl='x';").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    // --- NowPlaying ---

    #[test]
    fn now_playing_with_separator() {
        let m = NowPlaying::from_stream_title("Pink Floyd - Comfortably Numb");
        assert_eq!(m.artist.as_deref(), Some("Pink Floyd"));
        assert_eq!(m.title.as_deref(), Some("Comfortably Numb"));
    }

    #[test]
    fn now_playing_without_separator() {
        let m = NowPlaying::from_stream_title("Just A Title");
        assert_eq!(m.artist, None);
        assert_eq!(m.title.as_deref(), Some("Just A Title"));
    }

    #[test]
    fn now_playing_multiple_separators() {
        let m = NowPlaying::from_stream_title("A - B - C");
        assert_eq!(m.artist.as_deref(), Some("A"));
        assert_eq!(m.title.as_deref(), Some("B - C"));
    }

    #[test]
    fn now_playing_empty() {
        let m = NowPlaying::from_stream_title("   ");
        assert_eq!(m.artist, None);
        assert_eq!(m.title, None);
    }

    #[test]
    fn now_playing_from_record() {
        let r = parse_icy_block(b"StreamTitle='Artist - Song';").unwrap();
        let m = NowPlaying::from_record(&r).unwrap();
        assert_eq!(m.artist.as_deref(), Some("Artist"));
        assert!(NowPlaying::from_record(&MetadataRecord::new()).is_none());
    }
}
