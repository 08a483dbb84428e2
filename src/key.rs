//! Partition key extraction.
//!
//! A key is derived from the record's own bytes, scanning at most the first
//! few fields. Extraction never fails: records that cannot produce a usable
//! key yield [`ExtractedKey::Invalid`], and what happens to them is decided by
//! an explicit [`InvalidPolicy`].

use std::fmt;

/// Result of running a [`KeyExtractor`] over one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractedKey<'a> {
    Key(&'a str),
    Invalid,
}

/// Maps one record (a line, without its trailing newline) to a partition key.
///
/// Implementations must be cheap and must not panic on arbitrary bytes; they
/// run on the worker pool for every input line.
pub trait KeyExtractor: Send + Sync {
    fn extract<'a>(&self, record: &'a [u8]) -> ExtractedKey<'a>;
}

/// Field delimiter used by [`FieldPrefixExtractor`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delimiter {
    /// Runs of ASCII spaces and tabs.
    #[default]
    Whitespace,
    /// Exactly one `\t` between fields.
    Tab,
}

/// Takes one field of the record and keeps the part before a separator.
///
/// With the defaults, `9606.ENSP00000000233 9606.ENSP00000272298 ...` maps to
/// the key `9606`.
#[derive(Clone, Debug)]
pub struct FieldPrefixExtractor {
    pub delimiter: Delimiter,
    /// Zero-based index of the field carrying the key.
    pub field: usize,
    /// Records with fewer fields than this are invalid.
    pub min_fields: usize,
    /// Keep only the part of the field before the first occurrence of this
    /// byte. `None` keeps the whole field.
    pub prefix_separator: Option<u8>,
}

impl Default for FieldPrefixExtractor {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::Whitespace,
            field: 0,
            min_fields: 2,
            prefix_separator: Some(b'.'),
        }
    }
}

impl FieldPrefixExtractor {
    fn is_delim(&self, b: u8) -> bool {
        match self.delimiter {
            Delimiter::Whitespace => b == b' ' || b == b'\t',
            Delimiter::Tab => b == b'\t',
        }
    }

    /// Returns `(start, end)` of the first `needed` fields' key field, or
    /// `None` when the record has fewer fields than required.
    fn locate(&self, record: &[u8]) -> Option<(usize, usize)> {
        let needed = self.min_fields.max(self.field + 1);
        let mut seen = 0usize;
        let mut key_span = None;
        let mut i = 0usize;
        let len = record.len();

        while i < len && seen < needed {
            if self.delimiter == Delimiter::Whitespace {
                while i < len && self.is_delim(record[i]) {
                    i += 1;
                }
                if i == len {
                    break;
                }
            }
            let start = i;
            while i < len && !self.is_delim(record[i]) {
                i += 1;
            }
            if seen == self.field {
                key_span = Some((start, i));
            }
            seen += 1;
            if self.delimiter == Delimiter::Tab && i < len {
                // step over the single tab; an empty trailing field still counts
                i += 1;
                if i == len && seen < needed {
                    if seen == self.field {
                        key_span = Some((i, i));
                    }
                    seen += 1;
                }
            }
        }

        if seen < needed { None } else { key_span }
    }
}

impl KeyExtractor for FieldPrefixExtractor {
    fn extract<'a>(&self, record: &'a [u8]) -> ExtractedKey<'a> {
        let record = record.strip_suffix(b"\r").unwrap_or(record);
        let Some((start, end)) = self.locate(record) else {
            return ExtractedKey::Invalid;
        };
        let mut field = &record[start..end];
        if let Some(sep) = self.prefix_separator
            && let Some(pos) = field.iter().position(|b| *b == sep)
        {
            field = &field[..pos];
        }
        match std::str::from_utf8(field) {
            Ok(key) if is_valid_key(key) => ExtractedKey::Key(key),
            _ => ExtractedKey::Invalid,
        }
    }
}

/// Keys become part of file names, so only a conservative character set is
/// accepted.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'+' | b':'))
}

/// What to do with records whose key is [`ExtractedKey::Invalid`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InvalidPolicy {
    /// Count them and leave them out of every shard.
    #[default]
    Drop,
    /// Count them and route them to a catch-all shard with this key.
    CatchAll(String),
}

impl fmt::Display for InvalidPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidPolicy::Drop => write!(f, "drop"),
            InvalidPolicy::CatchAll(bucket) => write!(f, "catch-all:{bucket}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_prefix_key() {
        let ex = FieldPrefixExtractor::default();
        assert_eq!(
            ex.extract(b"9606.ENSP1 9606.ENSP2 0 0 0 150"),
            ExtractedKey::Key("9606")
        );
        assert_eq!(ex.extract(b"  511145.b0001\t511145.b0002"), ExtractedKey::Key("511145"));
    }

    #[test]
    fn too_few_fields_is_invalid() {
        let ex = FieldPrefixExtractor::default();
        assert_eq!(ex.extract(b"9606.ENSP1"), ExtractedKey::Invalid);
        assert_eq!(ex.extract(b""), ExtractedKey::Invalid);
        assert_eq!(ex.extract(b"   \t "), ExtractedKey::Invalid);
    }

    #[test]
    fn unsafe_or_empty_key_is_invalid() {
        let ex = FieldPrefixExtractor::default();
        assert_eq!(ex.extract(b".ENSP1 x"), ExtractedKey::Invalid);
        assert_eq!(ex.extract(b"../etc x"), ExtractedKey::Invalid);
        assert_eq!(ex.extract(b"\xff\xfe.a b"), ExtractedKey::Invalid);
    }

    #[test]
    fn tab_delimiter_counts_empty_fields() {
        let ex = FieldPrefixExtractor {
            delimiter: Delimiter::Tab,
            field: 1,
            min_fields: 3,
            prefix_separator: None,
        };
        assert_eq!(ex.extract(b"a\tkey_1\tc"), ExtractedKey::Key("key_1"));
        assert_eq!(ex.extract(b"a\tkey_1"), ExtractedKey::Invalid);
        assert_eq!(ex.extract(b"a\t\tc"), ExtractedKey::Invalid);
    }

    #[test]
    fn crlf_is_ignored_for_key() {
        let ex = FieldPrefixExtractor {
            min_fields: 1,
            ..Default::default()
        };
        assert_eq!(ex.extract(b"42\r"), ExtractedKey::Key("42"));
    }
}
