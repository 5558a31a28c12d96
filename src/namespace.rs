//! Collection namespace sanitization.
//!
//! User-supplied collection names must be reduced to schema-legal
//! identifiers before any store operation. The transform is a pure
//! function: the same raw name always maps to the same canonical name.
//! Two raw names may collide after sanitization; that collision is
//! accepted, not an error.

use crate::config::DEFAULT_COLLECTION;

/// Sanitize a raw collection name into a canonical identifier.
///
/// Steps, in order:
/// 1. Strip every character that is not alphanumeric.
/// 2. If nothing remains, use [`DEFAULT_COLLECTION`].
/// 3. Uppercase the first character and lowercase the remainder
///    (characters without case semantics pass through unchanged).
/// 4. If the result still starts with a digit, prefix it with
///    [`DEFAULT_COLLECTION`] so the identifier starts with a letter.
pub fn resolve(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
    if stripped.is_empty() {
        return DEFAULT_COLLECTION.to_string();
    }

    let mut name = String::with_capacity(stripped.len());
    let mut chars = stripped.chars();
    if let Some(first) = chars.next() {
        name.extend(first.to_uppercase());
    }
    for c in chars {
        name.extend(c.to_lowercase());
    }

    if name.chars().next().is_some_and(|c| c.is_numeric()) {
        return format!("{}{}", DEFAULT_COLLECTION, name);
    }
    name
}
