//! Terminal-safety filtering for lines captured from compiler and make output.

pub const DEFAULT_MAX_LINE_CHARS: usize = 4096;

const TRUNCATED_MARKER: &str = " ...[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Start,
    Csi,
    Osc,
    OscMaybeEnd,
    String,
    StringMaybeEnd,
}

/// Character-at-a-time filter for ANSI escapes and invisible controls.
struct Scrubber {
    state: Escape,
}

impl Scrubber {
    fn new() -> Self {
        Self {
            state: Escape::None,
        }
    }

    /// Returns the character to keep, if any.
    fn feed(&mut self, c: char) -> Option<char> {
        self.state = match (self.state, c) {
            (Escape::None, '\x1b') => Escape::Start,
            (Escape::None, '\t') => return Some(' '),
            (Escape::None, c) if c.is_control() || is_bidi_or_format(c) => Escape::None,
            (Escape::None, c) => return Some(c),

            (Escape::Start, '[') => Escape::Csi,
            (Escape::Start, ']') => Escape::Osc,
            (Escape::Start, 'P' | 'X' | '^' | '_') => Escape::String,
            (Escape::Start, _) => Escape::None,

            (Escape::Csi, c) if ('@'..='~').contains(&c) => Escape::None,
            (Escape::Csi, _) => Escape::Csi,

            (Escape::Osc, '\x07') => Escape::None,
            (Escape::Osc, '\x1b') => Escape::OscMaybeEnd,
            (Escape::Osc, _) => Escape::Osc,
            (Escape::OscMaybeEnd, '\\') => Escape::None,
            (Escape::OscMaybeEnd, '\x1b') => Escape::OscMaybeEnd,
            (Escape::OscMaybeEnd, _) => Escape::Osc,

            (Escape::String, '\x1b') => Escape::StringMaybeEnd,
            (Escape::String, _) => Escape::String,
            (Escape::StringMaybeEnd, '\\') => Escape::None,
            (Escape::StringMaybeEnd, '\x1b') => Escape::StringMaybeEnd,
            (Escape::StringMaybeEnd, _) => Escape::String,
        };
        None
    }
}

/// Strip escape sequences and control characters, capping the line at `max_chars`.
pub fn sanitize_output_line(input: &str, max_chars: usize) -> String {
    let max_chars = max_chars.max(1);
    let mut scrubber = Scrubber::new();
    let mut out = String::with_capacity(input.len().min(max_chars));
    let mut kept = 0usize;

    for c in input.chars() {
        let Some(c) = scrubber.feed(c) else {
            continue;
        };
        if kept == max_chars {
            out.push_str(TRUNCATED_MARKER);
            return out;
        }
        out.push(c);
        kept += 1;
    }
    out
}

fn is_bidi_or_format(c: char) -> bool {
    matches!(
        c,
        '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}
