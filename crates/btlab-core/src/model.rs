use std::fmt;

use crate::grammar::{Boundary, BACKTRACER_SPAN, EXPORT_SPAN};

#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub name: String,
    pub start: Option<f64>,
    pub stop: Option<f64>,
}

impl Span {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: None,
            stop: None,
        }
    }

    pub fn closed(name: impl Into<String>, start: f64, stop: f64) -> Self {
        Self {
            name: name.into(),
            start: Some(start),
            stop: Some(stop),
        }
    }

    pub(crate) fn boundary_mut(&mut self, boundary: Boundary) -> &mut Option<f64> {
        match boundary {
            Boundary::Start => &mut self.start,
            Boundary::Stop => &mut self.stop,
        }
    }

    /// Both boundaries, or `None` while the span is still open on either side.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        Some((self.start?, self.stop?))
    }

    pub fn missing_boundary(&self) -> Option<Boundary> {
        if self.start.is_none() {
            Some(Boundary::Start)
        } else if self.stop.is_none() {
            Some(Boundary::Stop)
        } else {
            None
        }
    }

    pub fn duration(&self) -> Option<f64> {
        self.bounds().map(|(start, stop)| stop - start)
    }

    /// The harness' own spans, as opposed to spans printed by the monitored program.
    pub fn is_harness_span(&self) -> bool {
        self.name == BACKTRACER_SPAN || self.name == EXPORT_SPAN
    }
}

/// Spans of one (program, configuration) run, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramRecord {
    spans: Vec<Span>,
    /// Word count attached to the `bt-export` span.
    pub btb_words: Option<u64>,
}

impl ProgramRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spans(spans: impl IntoIterator<Item = Span>) -> Self {
        let mut record = Self::new();
        for span in spans {
            record.insert(span);
        }
        record
    }

    /// Replaces a span of the same name in place, keeping its original position.
    pub fn insert(&mut self, span: Span) {
        match self.spans.iter_mut().find(|s| s.name == span.name) {
            Some(existing) => *existing = span,
            None => self.spans.push(span),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.name == name)
    }

    pub(crate) fn entry(&mut self, name: &str) -> &mut Span {
        let idx = match self.spans.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.spans.push(Span::new(name));
                self.spans.len() - 1
            }
        };
        &mut self.spans[idx]
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn backtracer(&self) -> Option<&Span> {
        self.get(BACKTRACER_SPAN)
    }

    pub fn export(&self) -> Option<&Span> {
        self.get(EXPORT_SPAN)
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunKey {
    pub trace_interval: f64,
    pub program: String,
}

impl RunKey {
    pub fn new(trace_interval: f64, program: impl Into<String>) -> Self {
        Self {
            trace_interval,
            program: program.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} s/{}", self.trace_interval, self.program)
    }
}
