//! Marker lines printed by instrumented binaries.
//!
//! Every matcher is substring tolerant: the sentinel may be preceded by arbitrary log noise
//! (serial console prefixes, program tags, ...). Matchers are independent of each other and each
//! one is tried exactly once per line.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Name of the span wrapping one monitored program.
pub const BACKTRACER_SPAN: &str = "backtracer";

/// Name of the span during which the trace buffer is exported.
pub const EXPORT_SPAN: &str = "bt-export";

pub const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// `=?=?= [start] (qsort)            1e240 us`
pub static SPAN_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?=\?=\s+\[(start|stop)\]\s+\((.*)\)\s+(0x)?([0-9a-fA-F]+)\s+us")
        .expect("Invalid span marker regex pattern")
});

/// `<*= [0:  123456]`, message register 0 carries the exported word count.
pub static EXPORT_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<\*=\s+\[0:\s*([0-9]+)").expect("Invalid export count regex pattern")
});

/// `=.=.= [  0,   0.010, ..., qsort]  s`
pub static FREEFORM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\.=\.=\s+\[(.*)\]").expect("Invalid freeform measurement regex pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Boundary {
    Start,
    Stop,
}

impl Boundary {
    pub fn as_str(self) -> &'static str {
        match self {
            Boundary::Start => "start",
            Boundary::Stop => "stop",
        }
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the digits of a span timestamp are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampRadix {
    /// Base 16 when prefixed with `0x` or when any digit is a hex letter, base 10 otherwise.
    #[default]
    Infer,
    /// Always base 16, for binaries printing `%llx` without a prefix.
    Hex,
}

impl TimestampRadix {
    fn radix_for(self, prefixed: bool, digits: &str) -> u32 {
        match self {
            TimestampRadix::Hex => 16,
            TimestampRadix::Infer => {
                if prefixed || digits.bytes().any(|b| b.is_ascii_alphabetic()) {
                    16
                } else {
                    10
                }
            }
        }
    }
}

/// Result of one matcher applied to one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker<'a> {
    SpanBoundary {
        boundary: Boundary,
        name: &'a str,
        /// Digits exactly as printed, without the `0x` prefix.
        digits: &'a str,
        radix: u32,
    },
    ExportCount {
        digits: &'a str,
    },
    FreeformLine {
        payload: &'a str,
    },
    NoMatch,
}

pub fn match_span_boundary(line: &str, radix: TimestampRadix) -> Marker<'_> {
    let Some(caps) = SPAN_MARKER_RE.captures(line) else {
        return Marker::NoMatch;
    };
    let boundary = match &caps[1] {
        "start" => Boundary::Start,
        _ => Boundary::Stop,
    };
    let prefixed = caps.get(3).is_some();
    let (Some(name), Some(digits)) = (caps.get(2), caps.get(4)) else {
        return Marker::NoMatch;
    };
    Marker::SpanBoundary {
        boundary,
        name: name.as_str(),
        digits: digits.as_str(),
        radix: radix.radix_for(prefixed, digits.as_str()),
    }
}

pub fn match_export_count(line: &str) -> Marker<'_> {
    match EXPORT_COUNT_RE.captures(line).and_then(|c| c.get(1)) {
        Some(digits) => Marker::ExportCount {
            digits: digits.as_str(),
        },
        None => Marker::NoMatch,
    }
}

pub fn match_freeform(line: &str) -> Marker<'_> {
    match FREEFORM_RE.captures(line).and_then(|c| c.get(1)) {
        Some(payload) => Marker::FreeformLine {
            payload: payload.as_str(),
        },
        None => Marker::NoMatch,
    }
}

/// Runs every matcher once, in grammar order, and keeps the hits.
pub fn scan_line(line: &str, radix: TimestampRadix) -> Vec<Marker<'_>> {
    [
        match_span_boundary(line, radix),
        match_export_count(line),
        match_freeform(line),
    ]
    .into_iter()
    .filter(|m| *m != Marker::NoMatch)
    .collect()
}

pub fn micros_to_seconds(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_SECOND
}
