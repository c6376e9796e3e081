//! Splits a byte stream into UTF-8 JSON lines, carrying partial-line state across reads.

/// Accumulates bytes across chunks and yields one text frame per newline.
///
/// Never parses JSON; that's the classifier's job (`crate::wire::Frame::classify`).
#[derive(Debug, Default)]
pub struct LineFramer {
    residual: String,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes, returning the complete lines it produced.
    ///
    /// Invalid UTF-8 is replaced lossily rather than dropped, matching the CLI's
    /// tendency to interleave the occasional non-JSON diagnostic byte sequence.
    pub fn push_chunk(&mut self, bytes: &[u8]) -> Vec<String> {
        self.residual.push_str(&String::from_utf8_lossy(bytes));
        self.drain_complete_lines()
    }

    fn drain_complete_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.residual.find('\n') {
            let line = self.residual[..pos].to_string();
            self.residual.drain(..=pos);
            push_trimmed(&mut lines, line);
        }
        lines
    }

    /// Call on EOF: flushes any non-empty residual as a final frame.
    pub fn finish(&mut self) -> Option<String> {
        if self.residual.is_empty() {
            return None;
        }
        let residual = std::mem::take(&mut self.residual);
        let mut lines = Vec::new();
        push_trimmed(&mut lines, residual);
        lines.pop()
    }
}

fn push_trimmed(lines: &mut Vec<String>, raw: String) {
    let trimmed = raw.trim_end_matches(['\r', ' ', '\t']);
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.push_chunk(b"{\"a\":1}\n{\"b").is_empty());
        let lines = framer.push_chunk(b"\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[test]
    fn trims_trailing_cr() {
        let mut framer = LineFramer::new();
        let lines = framer.push_chunk(b"{\"a\":1}\r\n");
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn drops_empty_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.push_chunk(b"\n\n{\"a\":1}\n\n");
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn flushes_residual_on_finish() {
        let mut framer = LineFramer::new();
        assert!(framer.push_chunk(b"{\"a\":1}").is_empty());
        assert_eq!(framer.finish(), Some("{\"a\":1}".to_string()));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn finish_with_no_residual_is_none() {
        let mut framer = LineFramer::new();
        framer.push_chunk(b"{\"a\":1}\n");
        assert_eq!(framer.finish(), None);
    }
}
