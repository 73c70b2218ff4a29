//! Canonical form of free-text entity names, used only as a lookup key.
//!
//! Punctuation is treated as a word separator, so `"nairobi-hq"` and
//! `"Nairobi  HQ"` both become `"NAIROBI HQ"`.

/// Normalize an entity name for equality matching.
///
/// Returns `None` for blank input or input made only of punctuation.
pub fn normalize(name: &str) -> Option<String> {
    // Upper-case first: case mapping can emit combining marks, which must
    // be stripped in the same pass to keep the function idempotent.
    let spaced: String = name
        .to_uppercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }

    Some(collapsed)
}
