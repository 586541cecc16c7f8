//! Newline index with LF/CRLF-robust line/byte mapping.
//!
//! - 1-based external line numbers.
//! - A trailing newline does not open a new line: `"a\nb\n"` has 2 lines.
//! - End bytes are exclusive and exclude a trailing `\r`.

#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Byte positions of every '\n' in the buffer.
    nl_positions: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn build(text: &str) -> Self {
        Self {
            nl_positions: text.match_indices('\n').map(|(i, _)| i).collect(),
            len: text.len(),
        }
    }

    /// Number of logical lines.
    pub fn line_count(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        match self.nl_positions.last() {
            Some(&last) if last + 1 == self.len => self.nl_positions.len(),
            _ => self.nl_positions.len() + 1,
        }
    }

    /// Start byte (inclusive) of a 1-based line.
    pub fn start_byte_of_line(&self, line1: usize) -> Option<usize> {
        if line1 == 0 || line1 > self.line_count() {
            return None;
        }
        if line1 == 1 {
            return Some(0);
        }
        self.nl_positions.get(line1 - 2).map(|&nl| nl + 1)
    }

    /// End byte (exclusive) of a 1-based line, without its line terminator.
    pub fn end_byte_of_line(&self, line1: usize, text: &str) -> Option<usize> {
        if line1 == 0 || line1 > self.line_count() {
            return None;
        }
        let end = match self.nl_positions.get(line1 - 1) {
            Some(&nl) => nl,
            None => self.len,
        };
        if end > 0 && text.as_bytes().get(end - 1) == Some(&b'\r') {
            return Some(end - 1);
        }
        Some(end)
    }

    /// Byte range for an inclusive 1-based line span.
    pub fn byte_range(&self, start1: usize, end1: usize, text: &str) -> Option<(usize, usize)> {
        if start1 == 0 || start1 > end1 {
            return None;
        }
        let s = self.start_byte_of_line(start1)?;
        let e = self.end_byte_of_line(end1, text)?;
        (s <= e).then_some((s, e))
    }

    /// 1-based line covering `byte`. Offsets at a '\n' belong to the line
    /// it terminates.
    pub fn line_of_byte(&self, byte: usize) -> usize {
        if self.len == 0 {
            return 0;
        }
        let idx = match self.nl_positions.binary_search(&byte) {
            Ok(pos) => pos,
            Err(pos) => pos,
        };
        idx + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_count() {
        assert_eq!(LineIndex::build("").line_count(), 0);
        assert_eq!(LineIndex::build("a").line_count(), 1);
        assert_eq!(LineIndex::build("a\n").line_count(), 1);
        assert_eq!(LineIndex::build("a\nb").line_count(), 2);
        assert_eq!(LineIndex::build("a\nb\n").line_count(), 2);
    }

    #[test]
    fn test_byte_range_crlf() {
        let text = "one\r\ntwo\r\nthree";
        let idx = LineIndex::build(text);
        let (s, e) = idx.byte_range(2, 2, text).unwrap();
        assert_eq!(&text[s..e], "two");
        let (s, e) = idx.byte_range(2, 3, text).unwrap();
        assert_eq!(&text[s..e], "two\r\nthree");
        assert!(idx.byte_range(3, 4, text).is_none());
    }

    #[test]
    fn test_line_of_byte() {
        let text = "ab\ncd\n";
        let idx = LineIndex::build(text);
        assert_eq!(idx.line_of_byte(0), 1);
        assert_eq!(idx.line_of_byte(2), 1);
        assert_eq!(idx.line_of_byte(3), 2);
    }
}
