//! Turns one raw log into a [`ProgramRecord`].

use std::io::BufRead;

use tracing::{debug, warn};

use crate::error::ExtractionError;
use crate::grammar::{micros_to_seconds, scan_line, Marker, TimestampRadix};
use crate::model::ProgramRecord;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractOptions {
    pub radix: TimestampRadix,
}

/// An export count smaller than the one already retained.
///
/// Multiple export flushes print growing cumulative counts; a smaller value after a peak does not
/// replace the peak (last-observed-maximum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportAnomaly {
    pub line_number: usize,
    pub kept: u64,
    pub observed: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub record: ProgramRecord,
    /// Payloads of free-form measurement lines, in log order.
    pub measurement_lines: Vec<String>,
    pub anomalies: Vec<ExportAnomaly>,
}

#[derive(Debug, Default)]
struct Extractor {
    options: ExtractOptions,
    out: Extraction,
}

impl Extractor {
    fn new(options: ExtractOptions) -> Self {
        Self {
            options,
            out: Extraction::default(),
        }
    }

    fn line(&mut self, line_number: usize, line: &str) -> Result<(), ExtractionError> {
        for marker in scan_line(line, self.options.radix) {
            debug!(line_number, line = line.trim_end(), "matched marker line");
            match marker {
                Marker::SpanBoundary {
                    boundary,
                    name,
                    digits,
                    radix,
                } => {
                    let micros = u64::from_str_radix(digits, radix).map_err(|_| {
                        ExtractionError::InvalidNumber {
                            field: "timestamp",
                            value: digits.to_string(),
                            line_number,
                            line: line.to_string(),
                        }
                    })?;
                    let slot = self.out.record.entry(name).boundary_mut(boundary);
                    if slot.is_some() {
                        return Err(ExtractionError::DuplicateBoundary {
                            span: name.to_string(),
                            boundary,
                            line_number,
                            line: line.to_string(),
                        });
                    }
                    *slot = Some(micros_to_seconds(micros));
                }
                Marker::ExportCount { digits } => {
                    let words: u64 = digits.parse().map_err(|_| ExtractionError::InvalidNumber {
                        field: "export word count",
                        value: digits.to_string(),
                        line_number,
                        line: line.to_string(),
                    })?;
                    self.export_count(line_number, words);
                }
                Marker::FreeformLine { payload } => {
                    self.out.measurement_lines.push(payload.to_string());
                }
                Marker::NoMatch => {}
            }
        }
        Ok(())
    }

    fn export_count(&mut self, line_number: usize, observed: u64) {
        match self.out.record.btb_words {
            Some(kept) if observed < kept => {
                warn!(
                    line_number,
                    kept, observed, "export word count went down, keeping the larger value"
                );
                self.out.anomalies.push(ExportAnomaly {
                    line_number,
                    kept,
                    observed,
                });
            }
            _ => self.out.record.btb_words = Some(observed),
        }
    }

    fn finish(self) -> Result<Extraction, ExtractionError> {
        for span in self.out.record.spans() {
            if let Some(missing) = span.missing_boundary() {
                return Err(ExtractionError::IncompleteSpan {
                    span: span.name.clone(),
                    missing,
                });
            }
        }
        Ok(self.out)
    }
}

pub fn extract(log_text: &str) -> Result<Extraction, ExtractionError> {
    extract_with(log_text, ExtractOptions::default())
}

pub fn extract_with(log_text: &str, options: ExtractOptions) -> Result<Extraction, ExtractionError> {
    let mut extractor = Extractor::new(options);
    for (idx, line) in log_text.lines().enumerate() {
        extractor.line(idx + 1, line)?;
    }
    extractor.finish()
}

/// Same as [`extract_with`], reading the log line by line.
///
/// Serial consoles emit stray bytes; lines that are not valid UTF-8 are decoded lossily so the
/// markers around them still match.
pub fn extract_reader<R: BufRead>(
    mut reader: R,
    options: ExtractOptions,
) -> Result<Extraction, ExtractionError> {
    let mut extractor = Extractor::new(options);
    let mut buf = Vec::new();
    let mut line_number = 0;
    loop {
        buf.clear();
        line_number += 1;
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|source| ExtractionError::Io {
                line_number,
                source,
            })?;
        if read == 0 {
            break;
        }
        let mut raw = buf.as_slice();
        if let Some(rest) = raw.strip_suffix(b"\n") {
            raw = rest.strip_suffix(b"\r").unwrap_or(rest);
        }
        extractor.line(line_number, &String::from_utf8_lossy(raw))?;
    }
    extractor.finish()
}
