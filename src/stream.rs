//! Stream Processor (C2): turns raw sandbox output bytes into well-formed,
//! bounded outbound chunks.
//!
//! Line endings are normalized (`\r\n` and lone `\r` become `\n`) and partial
//! UTF-8 sequences are held back across calls so a chunk boundary never
//! splits a codepoint. Control characters and ANSI escapes are passed
//! through unless the connection's policy disables them.

/// Output-processing policy, set from configuration per connection.
#[derive(Debug, Clone, Copy)]
pub struct StreamPolicy {
    pub preserve_ansi: bool,
    pub preserve_control_chars: bool,
    pub max_chunk_bytes: usize,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            preserve_ansi: true,
            preserve_control_chars: true,
            max_chunk_bytes: 4096,
        }
    }
}

/// Running counters exposed for diagnostics (`/health`, logs).
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub chunks_out: u64,
    pub errors: u64,
}

/// Stateful processor for one session's output stream.
///
/// `pending` holds bytes that cannot yet be emitted: a carried `\r` that
/// might be the start of `\r\n`, or a UTF-8 sequence still missing its
/// continuation bytes.
pub struct StreamProcessor {
    policy: StreamPolicy,
    pending: Vec<u8>,
    stats: StreamStats,
}

impl StreamProcessor {
    #[must_use]
    pub fn new(policy: StreamPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            stats: StreamStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Feed raw bytes in, get zero or more ready-to-send chunks out.
    pub fn push(&mut self, input: &[u8]) -> Vec<String> {
        self.stats.bytes_in += input.len() as u64;

        let mut combined = std::mem::take(&mut self.pending);
        combined.extend_from_slice(input);

        let normalized = normalize_line_endings(&combined);
        let (ready, held_back) = split_complete_utf8(&normalized);
        self.pending = held_back;

        let text = String::from_utf8_lossy(&ready);
        let text = if self.policy.preserve_control_chars && self.policy.preserve_ansi {
            text.into_owned()
        } else {
            sanitize(&text, self.policy)
        };

        if text.is_empty() {
            return Vec::new();
        }

        self.emit_chunks(&text)
    }

    /// Force out anything buffered (e.g. on an idle tick or before `end`).
    pub fn flush(&mut self) -> Vec<String> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let pending = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&pending).into_owned();
        self.stats.errors += u64::from(matches!(String::from_utf8(pending.clone()), Err(_)));
        if text.is_empty() {
            Vec::new()
        } else {
            self.emit_chunks(&text)
        }
    }

    /// Terminate the stream: flush, and report whether trailing bytes had to
    /// be lossily replaced rather than cleanly decoded.
    pub fn end(&mut self) -> Vec<String> {
        self.flush()
    }

    fn emit_chunks(&mut self, text: &str) -> Vec<String> {
        let max = self.policy.max_chunk_bytes.max(1);
        let mut out = Vec::new();
        let bytes = text.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            let mut end = (start + max).min(bytes.len());
            // never split a chunk mid-codepoint
            while end < bytes.len() && !is_utf8_boundary(bytes, end) {
                end -= 1;
            }
            if end == start {
                end = bytes.len();
            }
            let chunk = std::str::from_utf8(&bytes[start..end])
                .unwrap_or_default()
                .to_string();
            self.stats.bytes_out += chunk.len() as u64;
            self.stats.chunks_out += 1;
            out.push(chunk);
            start = end;
        }
        out
    }
}

fn is_utf8_boundary(bytes: &[u8], idx: usize) -> bool {
    idx == bytes.len() || (bytes[idx] & 0xC0) != 0x80
}

/// `\r\n -> \n`, lone `\r -> \n`. Does not touch bytes inside an incomplete
/// trailing codepoint (those are held back by the caller already).
fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'\r' if input.get(i + 1) == Some(&b'\n') => {
                out.push(b'\n');
                i += 2;
            }
            b'\r' => {
                out.push(b'\n');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Split `input` into (complete-codepoint prefix, held-back suffix). The
/// suffix is at most 3 bytes — the longest an incomplete UTF-8 sequence can be.
fn split_complete_utf8(input: &[u8]) -> (Vec<u8>, Vec<u8>) {
    if input.len() < 4 {
        match std::str::from_utf8(input) {
            Ok(_) => return (input.to_vec(), Vec::new()),
            Err(_) => { /* fall through to boundary scan below */ }
        }
    }
    let mut split_at = input.len();
    for back in 1..=3.min(input.len()) {
        let idx = input.len() - back;
        if (input[idx] & 0xC0) == 0xC0 || (input[idx] & 0x80) == 0 {
            // start of a multi-byte (or single-byte ascii) sequence at idx
            let candidate = &input[idx..];
            if std::str::from_utf8(candidate).is_err() {
                split_at = idx;
            }
            break;
        }
    }
    (input[..split_at].to_vec(), input[split_at..].to_vec())
}

/// Strip C0 control bytes outside `{TAB, LF, BS, CR}` and CSI escape sequences.
fn sanitize(input: &str, policy: StreamPolicy) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && !policy.preserve_ansi {
            // swallow CSI: ESC '[' params... final-byte
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        if c.is_control() && !policy.preserve_control_chars {
            if matches!(c, '\t' | '\n' | '\u{8}' | '\r') {
                out.push(c);
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_crlf_and_lone_cr() {
        let mut p = StreamProcessor::new(StreamPolicy::default());
        let chunks = p.push(b"a\r\nb\rc\n");
        assert_eq!(chunks.concat(), "a\nb\nc\n");
    }

    #[test]
    fn never_splits_utf8_codepoint_across_pushes() {
        let mut p = StreamProcessor::new(StreamPolicy::default());
        // '€' is E2 82 AC — feed it byte by byte.
        let bytes = "€".as_bytes();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&p.push(&[*b]).concat());
        }
        out.push_str(&p.flush().concat());
        assert_eq!(out, "€");
    }

    #[test]
    fn round_trip_law_l2() {
        let a = b"hello ";
        let b = b"world\r\n";
        let mut p1 = StreamProcessor::new(StreamPolicy::default());
        let mut combined = p1.push(a).concat();
        combined.push_str(&p1.push(b).concat());
        combined.push_str(&p1.end().concat());

        let mut p2 = StreamProcessor::new(StreamPolicy::default());
        let mut both = a.to_vec();
        both.extend_from_slice(b);
        let mut combined2 = p2.push(&both).concat();
        combined2.push_str(&p2.end().concat());

        assert_eq!(combined, combined2);
    }

    #[test]
    fn chunking_respects_max_chunk_bytes_without_splitting_codepoints() {
        let mut p = StreamProcessor::new(StreamPolicy {
            max_chunk_bytes: 4,
            ..StreamPolicy::default()
        });
        let chunks = p.push("ab€cd".as_bytes());
        for c in &chunks {
            assert!(c.len() <= 4 || c.chars().count() == 1);
        }
        assert_eq!(chunks.concat(), "ab€cd");
    }

    #[test]
    fn sanitize_strips_csi_and_nonwhitelisted_control_bytes() {
        let mut p = StreamProcessor::new(StreamPolicy {
            preserve_ansi: false,
            preserve_control_chars: false,
            ..StreamPolicy::default()
        });
        let chunks = p.push(b"\x1b[31mred\x1b[0m\x07\tok\n");
        assert_eq!(chunks.concat(), "red\tok\n");
    }
}
