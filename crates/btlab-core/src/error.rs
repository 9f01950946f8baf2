use thiserror::Error;

use crate::grammar::Boundary;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("duplicate boundary: [{boundary}] already seen for span '{span}' (line {line_number}: {line:?})")]
    DuplicateBoundary {
        span: String,
        boundary: Boundary,
        line_number: usize,
        line: String,
    },
    #[error("unparseable {field} '{value}' (line {line_number}: {line:?})")]
    InvalidNumber {
        field: &'static str,
        value: String,
        line_number: usize,
        line: String,
    },
    #[error("span '{span}' has no [{missing}] marker")]
    IncompleteSpan { span: String, missing: Boundary },
    #[error("failed to read log line {line_number}: {source}")]
    Io {
        line_number: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing backtracer span (or one of its boundaries)")]
    MissingBacktracer,
    #[error("missing export span (or one of its boundaries) although export was requested")]
    MissingExport,
    #[error("span '{span}' has no [{missing}] boundary")]
    IncompleteSpan { span: String, missing: Boundary },
    #[error(
        "nesting violation, span={span}: expected backtracer.start {bt_start} <= start {start} \
         < stop {stop} <= backtracer.stop {bt_stop}"
    )]
    NestingViolation {
        span: String,
        start: f64,
        stop: f64,
        bt_start: f64,
        bt_stop: f64,
    },
    #[error(
        "export ordering violation: expected backtracer.stop {bt_stop} < bt-export.start \
         {export_start} < bt-export.stop {export_stop}"
    )]
    ExportOrdering {
        bt_stop: f64,
        export_start: f64,
        export_stop: f64,
    },
}
