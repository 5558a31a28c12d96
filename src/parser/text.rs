//! Plain-text extraction utilities

/// Decode bytes as text, replacing invalid UTF-8 sequences.
pub fn extract_plain_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

/// Leading excerpt of extracted text, bounded in characters.
pub fn build_preview(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossy_decode_keeps_valid_parts() {
        let text = extract_plain_text(&[b'o', b'k', 0xFF, b'!']);
        assert!(text.starts_with("ok"));
        assert!(text.ends_with('!'));
    }

    #[test]
    fn preview_is_bounded_and_trimmed() {
        assert_eq!(build_preview("  hello world  ", 5), "hello");
        assert_eq!(build_preview("short", 100), "short");
        assert_eq!(build_preview("", 10), "");
        // Bound is in characters, not bytes.
        assert_eq!(build_preview("日本語テキスト", 3), "日本語");
    }
}
