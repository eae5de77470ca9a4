//! Reading the separation tool's diagnostic text.
//!
//! Everything that knows what the tool prints lives here; the supervisor only sees
//! integer percentages and hints.

use once_cell::sync::Lazy;
use regex::Regex;

/// Progress-bar marker such as ` 42%|████▎     | 12.3/29.2`.
static MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,3})%\|").expect("static regex"));

/// Start of the band the external process reports into.
pub const EXTERNAL_BAND_START: u8 = 20;
/// Percentage published once the process is done and output is being collected.
pub const FINALIZE_START: u8 = 80;

/// Last percentage marker on the line, clamped to 100.
pub fn parse_progress_marker(line: &str) -> Option<u8> {
    MARKER
        .captures_iter(line)
        .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
        .last()
        .map(|p| p.min(100) as u8)
}

/// External 0..=100 → canonical 20..=80.
pub fn map_external_percent(theirs: u8) -> u8 {
    let theirs = theirs.min(100) as u16;
    EXTERNAL_BAND_START + (theirs * 6 / 10) as u8
}

/// Hands out only strictly increasing percentages.
#[derive(Debug, Clone)]
pub struct MonotonicProgress {
    last: u8,
}

impl MonotonicProgress {
    pub fn starting_at(last: u8) -> Self {
        Self { last }
    }

    pub fn last(&self) -> u8 {
        self.last
    }

    pub fn offer(&mut self, pct: u8) -> Option<u8> {
        let pct = pct.min(100);
        if pct > self.last {
            self.last = pct;
            Some(pct)
        } else {
            None
        }
    }
}

/// Splits a byte stream into lines on `\n` or `\r`; progress bars redraw with bare `\r`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                self.take_line(&mut lines);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Remaining partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.take_line(&mut lines);
        lines.pop()
    }

    fn take_line(&mut self, out: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        if !line.is_empty() {
            out.push(line);
        }
    }
}

/// Likely cause of a failed run, from the tail of its diagnostics.
pub fn failure_hint<'a, I>(lines: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a String>,
{
    let text = lines
        .into_iter()
        .map(|l| l.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");
    if text.contains("out of memory") || text.contains("memoryerror") {
        Some("out of memory")
    } else if text.contains("permission denied") {
        Some("permission denied")
    } else if text.contains("no space left") {
        Some("disk full")
    } else if text.contains("no module named") {
        Some("separation tool not installed")
    } else {
        None
    }
}
