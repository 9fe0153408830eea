//! Line framing
//!
//! Accumulates bytes as they arrive and splits them into delimiter-terminated
//! lines, independent of how the serial driver happened to chunk them.

use crate::DEFAULT_MAX_LINE_LEN;

/// Splits a byte stream into lines.
///
/// The delimiter is stripped from each line, as is a carriage return right
/// before it. Bytes after the last delimiter stay buffered for the next
/// [`feed`](LineFramer::feed). A peer that never sends a delimiter cannot grow
/// the buffer without bound: once more than `max_line_len` unterminated bytes
/// are buffered, the first `max_line_len` of them are emitted as a line.
#[derive(Debug, Clone)]
pub struct LineFramer {
    buffer: Vec<u8>,
    delimiter: u8,
    max_line_len: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(b'\n', DEFAULT_MAX_LINE_LEN)
    }
}

impl LineFramer {
    /// Create a framer
    pub fn new(delimiter: u8, max_line_len: usize) -> Self {
        let max_line_len = max_line_len.max(1);
        Self {
            buffer: Vec::with_capacity(max_line_len.min(1024)),
            delimiter,
            max_line_len,
        }
    }

    /// Append bytes and iterate over the lines they complete.
    ///
    /// Lines the iterator did not get to before being dropped are produced by
    /// the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Lines<'_> {
        self.buffer.extend_from_slice(bytes);
        Lines {
            framer: self,
            pos: 0,
        }
    }

    /// Take the buffered partial line, if any
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode(strip_cr(&self.buffer));
        self.buffer.clear();
        Some(line)
    }

    /// Number of buffered bytes not yet emitted
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Discard buffered bytes
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Longest line emitted before a forced split
    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }
}

fn strip_cr(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Lines completed by one [`LineFramer::feed`]
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
    pos: usize,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let max = self.framer.max_line_len;
        let rest = &self.framer.buffer[self.pos..];

        if let Some(end) = rest.iter().position(|&b| b == self.framer.delimiter) {
            let content = strip_cr(&rest[..end]);
            if content.len() <= max {
                let line = decode(content);
                self.pos += end + 1;
                return Some(line);
            }
        } else if strip_cr(rest).len() <= max {
            return None;
        }

        // Too long: emit a bounded line and keep the remainder
        tracing::warn!(max_line_len = max, "line exceeded maximum length, splitting");
        let line = decode(&rest[..max]);
        self.pos += max;
        Some(line)
    }
}

impl Drop for Lines<'_> {
    fn drop(&mut self) {
        self.framer.buffer.drain(..self.pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collect(framer: &mut LineFramer, bytes: &[u8]) -> Vec<String> {
        framer.feed(bytes).collect()
    }

    #[test]
    fn test_single_feed_multiple_lines() {
        let mut framer = LineFramer::default();
        assert_eq!(collect(&mut framer, b"AT\r\nOK\r\n"), vec!["AT", "OK"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_every_split_point() {
        let stream = b"AT\r\nOK\r\n";
        for split in 0..=stream.len() {
            let mut framer = LineFramer::default();
            let mut lines = collect(&mut framer, &stream[..split]);
            lines.extend(collect(&mut framer, &stream[split..]));
            assert_eq!(lines, vec!["AT", "OK"], "split at {}", split);
        }
    }

    #[test]
    fn test_partial_line_is_retained() {
        let mut framer = LineFramer::default();
        assert!(collect(&mut framer, b"+BLEADDR:").is_empty());
        assert_eq!(framer.pending(), 9);
        assert_eq!(
            collect(&mut framer, b"\"f8:7f:24:87:1c:7b\"\r\n"),
            vec!["+BLEADDR:\"f8:7f:24:87:1c:7b\""]
        );
    }

    #[test]
    fn test_unconsumed_lines_come_back() {
        let mut framer = LineFramer::default();
        {
            let mut lines = framer.feed(b"one\ntwo\nthree\n");
            assert_eq!(lines.next().as_deref(), Some("one"));
        }
        assert_eq!(collect(&mut framer, b""), vec!["two", "three"]);
    }

    #[test]
    fn test_bare_lf_and_empty_lines() {
        let mut framer = LineFramer::default();
        assert_eq!(collect(&mut framer, b"a\n\r\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_overflow_without_delimiter() {
        let mut framer = LineFramer::new(b'\n', 8);
        let lines = collect(&mut framer, &[b'x'; 20]);
        assert_eq!(lines, vec!["xxxxxxxx", "xxxxxxxx"]);
        assert_eq!(framer.pending(), 4);
        assert!(lines.iter().all(|l| l.len() <= 8));
    }

    #[test]
    fn test_overflow_accumulated_across_feeds() {
        let mut framer = LineFramer::new(b'\n', 8);
        for _ in 0..100 {
            let lines = collect(&mut framer, b"abc");
            assert!(lines.iter().all(|l| l.len() == 8));
            assert!(framer.pending() <= 8);
        }
    }

    #[test]
    fn test_line_at_exact_limit_is_not_split() {
        let mut framer = LineFramer::new(b'\n', 4);
        assert!(collect(&mut framer, b"ABCD\r").is_empty());
        assert_eq!(collect(&mut framer, b"\n"), vec!["ABCD"]);
    }

    #[test]
    fn test_long_terminated_line_is_split() {
        let mut framer = LineFramer::new(b'\n', 4);
        assert_eq!(collect(&mut framer, b"ABCDEF\n"), vec!["ABCD", "EF"]);
    }

    #[test]
    fn test_custom_delimiter() {
        let mut framer = LineFramer::new(b'>', 64);
        assert_eq!(collect(&mut framer, b"OK>ERROR>"), vec!["OK", "ERROR"]);
    }

    #[test]
    fn test_flush_partial() {
        let mut framer = LineFramer::default();
        assert!(collect(&mut framer, b"no newline\r").is_empty());
        assert_eq!(framer.flush().as_deref(), Some("no newline"));
        assert!(framer.flush().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut framer = LineFramer::default();
        assert_eq!(collect(&mut framer, b"\xffOK\n"), vec!["\u{fffd}OK"]);
    }
}
