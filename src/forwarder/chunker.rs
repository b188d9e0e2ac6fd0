//! Chunk boundary selection.

/// Smallest chunk bound honoured; any UTF-8 character fits in it.
pub const MIN_CHUNK_BYTES: usize = 4;

/// Length in bytes of the next chunk to cut from the front of `remaining`.
///
/// Whole buffers that fit are taken as-is. Otherwise the cut goes just after
/// the last newline inside the first `max` bytes, provided that newline sits
/// at or beyond `newline_window * max`; failing that, at `max` rounded down
/// to a UTF-8 boundary. `max` is raised to [`MIN_CHUNK_BYTES`] first, and the
/// result never exceeds that bound.
pub fn next_cut(remaining: &str, max: usize, newline_window: f64) -> usize {
    let max = max.max(MIN_CHUNK_BYTES);
    if remaining.len() <= max {
        return remaining.len();
    }

    let window_start = (max as f64 * newline_window).floor() as usize;
    let bytes = remaining.as_bytes();
    if let Some(pos) = bytes[..max].iter().rposition(|&b| b == b'\n') {
        if pos >= window_start {
            return pos + 1;
        }
    }

    let mut cut = max;
    while !remaining.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

/// Split `buffer` into chunks of at most `max` bytes.
pub fn split_chunks(buffer: &str, max: usize, newline_window: f64) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = buffer;
    while !rest.is_empty() {
        let cut = next_cut(rest, max, newline_window);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Truncate `s` to at most `max` bytes on a character boundary.
pub fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}
