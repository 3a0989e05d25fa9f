//! UTF-16 offset arithmetic.
//!
//! Every offset that crosses the sync boundary is counted in UTF-16 code
//! units. Offsets that land inside a surrogate pair or past the end are
//! clamped to the nearest valid position and logged.

use tracing::warn;

pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Convert a UTF-16 offset to a byte offset, clamping to a char boundary.
pub fn utf16_to_byte(s: &str, offset: usize) -> usize {
    let mut units = 0;
    for (byte, ch) in s.char_indices() {
        if units >= offset {
            if units > offset {
                warn!("UTF-16 offset {} splits a surrogate pair, clamping", offset);
            }
            return byte;
        }
        units += ch.len_utf16();
    }
    if units < offset {
        warn!("UTF-16 offset {} past end ({}), clamping", offset, units);
    } else if units > offset {
        warn!("UTF-16 offset {} splits a surrogate pair, clamping", offset);
    }
    s.len()
}

/// Convert a UTF-16 offset to a char (Unicode scalar) offset.
pub fn utf16_to_char(s: &str, offset: usize) -> usize {
    let byte = utf16_to_byte(s, offset);
    s[..byte].chars().count()
}

pub fn char_to_utf16(s: &str, chars: usize) -> usize {
    s.chars().take(chars).map(char::len_utf16).sum()
}

/// Replace `delete` code units at `index` with `insert`.
pub fn splice_utf16(s: &str, index: usize, delete: usize, insert: &str) -> String {
    let start = utf16_to_byte(s, index);
    let start_units = utf16_len(&s[..start]);
    let end = utf16_to_byte(s, start_units + delete);
    let mut out = String::with_capacity(s.len() + insert.len());
    out.push_str(&s[..start]);
    out.push_str(insert);
    out.push_str(&s[end..]);
    out
}

/// Slice by UTF-16 range, clamped.
pub fn slice_utf16(s: &str, start: usize, end: usize) -> &str {
    let start = utf16_to_byte(s, start);
    let end = utf16_to_byte(s, end).max(start);
    &s[start..end]
}

/// Minimal change turning one string into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSplice {
    /// Start of the change in UTF-16 code units.
    pub index: usize,
    /// Code units removed from the old string.
    pub delete: usize,
    /// Removed text.
    pub removed: String,
    pub insert: String,
}

/// Compute the changed middle span between `old` and `new` by stripping the
/// common prefix and suffix. Works on chars so surrogate pairs never split.
pub fn compute_splice(old: &str, new: &str) -> Option<TextSplice> {
    if old == new {
        return None;
    }
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed: String = old_chars[prefix..old_chars.len() - suffix].iter().collect();
    let insert: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    Some(TextSplice {
        index: old_chars[..prefix].iter().map(|c| c.len_utf16()).sum(),
        delete: utf16_len(&removed),
        removed,
        insert,
    })
}
