//! Small helpers shared across modules.

/// Printable, length-capped view of a wire payload for log lines.
///
/// Invalid UTF-8 is replaced and control characters are escaped. Anything
/// past `max_chars` characters is cut and marked with `...`.
pub fn payload_preview(payload: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(payload);
    let mut preview = String::with_capacity(max_chars.min(text.len()));
    for c in text.chars().take(max_chars) {
        if c.is_control() {
            preview.extend(c.escape_default());
        } else {
            preview.push(c);
        }
    }
    if text.chars().nth(max_chars).is_some() {
        preview.push_str("...");
    }
    preview
}
