use std::collections::VecDeque;

/// Per-push cap on single-line evictions before falling back to a one-shot compaction.
const MAX_EVICTION_PASSES: usize = 256;

/// Line buffer that never holds more than `max_chars` characters (newlines included).
/// Oldest lines are evicted first, so the newest output always survives.
#[derive(Debug, Clone)]
pub struct BoundedOutput {
    lines: VecDeque<String>,
    chars: usize,
    max_chars: usize,
    truncated: bool,
}

/// Snapshot of a finished stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

impl BoundedOutput {
    pub fn new(max_chars: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            chars: 0,
            max_chars: max_chars.max(1),
            truncated: false,
        }
    }

    pub fn push(&mut self, line: &str) {
        let cost = line_cost(line);
        self.lines.push_back(line.to_string());
        self.chars += cost;

        let mut passes = 0;
        while self.chars > self.max_chars && passes < MAX_EVICTION_PASSES && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.chars -= line_cost(&old);
                self.truncated = true;
            }
            passes += 1;
        }
        if self.chars > self.max_chars {
            self.compact();
        }
    }

    /// Keep the longest suffix of whole lines that fits; trim the newest line if even
    /// that one alone is too long. Runs in a single pass over the buffer.
    fn compact(&mut self) {
        self.truncated = true;
        let mut budget = self.max_chars;
        let mut keep = 0usize;
        for line in self.lines.iter().rev() {
            let cost = line_cost(line);
            if cost > budget {
                break;
            }
            budget -= cost;
            keep += 1;
        }

        if keep == 0 {
            let newest = self.lines.pop_back().unwrap_or_default();
            let tail = tail_chars(&newest, self.max_chars.saturating_sub(1));
            self.lines.clear();
            self.chars = line_cost(&tail);
            self.lines.push_back(tail);
            return;
        }

        let drop = self.lines.len() - keep;
        self.lines.drain(..drop);
        self.chars = self.max_chars - budget;
    }

    pub fn len_chars(&self) -> usize {
        self.chars
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.chars);
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            text: self.text(),
            truncated: self.truncated,
        }
    }
}

fn line_cost(line: &str) -> usize {
    line.chars().count() + 1
}

fn tail_chars(s: &str, n: usize) -> String {
    let total = s.chars().count();
    s.chars().skip(total.saturating_sub(n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_under_bound_and_keeps_newest() {
        let mut buf = BoundedOutput::new(100);
        for i in 0..1_000 {
            buf.push(&format!("line {i:04}"));
            assert!(buf.len_chars() <= 100);
        }
        assert!(buf.is_truncated());
        let text = buf.text();
        assert!(text.ends_with("line 0999\n"));
        assert!(!text.contains("line 0000"));
        assert_eq!(text.chars().count(), buf.len_chars());
    }

    #[test]
    fn oversized_line_is_trimmed_to_its_tail() {
        let mut buf = BoundedOutput::new(10);
        buf.push("short");
        buf.push("abcdefghijklmnopqrstuvwxyz");
        assert!(buf.len_chars() <= 10);
        assert_eq!(buf.text(), "rstuvwxyz\n");
    }

    #[test]
    fn many_tiny_lines_then_one_large_converges() {
        let mut buf = BoundedOutput::new(5_000);
        for _ in 0..4_000 {
            buf.push("");
        }
        buf.push(&"x".repeat(4_990));
        assert!(buf.len_chars() <= 5_000);
        assert!(buf.text().contains(&"x".repeat(4_990)));
    }

    #[test]
    fn untouched_when_under_bound() {
        let mut buf = BoundedOutput::new(1_000);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.snapshot(), CapturedOutput {
            text: "a\nb\n".into(),
            truncated: false,
        });
    }
}
