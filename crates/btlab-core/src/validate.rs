use crate::error::ValidationError;
use crate::grammar::Boundary;
use crate::model::ProgramRecord;

/// Checks the temporal nesting of one run's spans. The first violation is returned.
///
/// Program spans must lie within the backtracer span, and when `export_enabled` the export span
/// must start after the backtracer span has stopped.
pub fn validate(record: &ProgramRecord, export_enabled: bool) -> Result<(), ValidationError> {
    let (bt_start, bt_stop) = record
        .backtracer()
        .and_then(|s| s.bounds())
        .ok_or(ValidationError::MissingBacktracer)?;

    let export = if export_enabled {
        Some(
            record
                .export()
                .and_then(|s| s.bounds())
                .ok_or(ValidationError::MissingExport)?,
        )
    } else {
        None
    };

    for span in record.spans().iter().filter(|s| !s.is_harness_span()) {
        let Some((start, stop)) = span.bounds() else {
            return Err(ValidationError::IncompleteSpan {
                span: span.name.clone(),
                missing: span.missing_boundary().unwrap_or(Boundary::Start),
            });
        };
        if !(bt_start <= start && start < stop && stop <= bt_stop) {
            return Err(ValidationError::NestingViolation {
                span: span.name.clone(),
                start,
                stop,
                bt_start,
                bt_stop,
            });
        }
    }

    if let Some((export_start, export_stop)) = export {
        if !(bt_stop < export_start && export_start < export_stop) {
            return Err(ValidationError::ExportOrdering {
                bt_stop,
                export_start,
                export_stop,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    fn scenario(app_stop: f64) -> ProgramRecord {
        ProgramRecord::from_spans([
            Span::closed("backtracer", 0.0, 10.0),
            Span::closed("app", 2.0, app_stop),
            Span::closed("bt-export", 11.0, 12.0),
        ])
    }

    #[test]
    fn contained_spans_pass() {
        validate(&scenario(8.0), true).expect("nested record must validate");
    }

    #[test]
    fn span_leaving_backtracer_fails_with_values() {
        let err = validate(&scenario(11.0), true).expect_err("app.stop beyond backtracer");
        assert_eq!(
            err,
            ValidationError::NestingViolation {
                span: "app".to_string(),
                start: 2.0,
                stop: 11.0,
                bt_start: 0.0,
                bt_stop: 10.0,
            }
        );
        let msg = err.to_string();
        assert!(msg.contains("span=app"), "unexpected message: {}", msg);
        assert!(msg.contains("11"), "unexpected message: {}", msg);
        assert!(msg.contains("10"), "unexpected message: {}", msg);
    }

    #[test]
    fn nesting_edges_follow_the_invariant() {
        let at_edges = ProgramRecord::from_spans([
            Span::closed("backtracer", 1.0, 5.0),
            Span::closed("app", 1.0, 5.0),
        ]);
        validate(&at_edges, false).expect("shared edges are allowed");

        let empty = ProgramRecord::from_spans([
            Span::closed("backtracer", 1.0, 5.0),
            Span::closed("app", 3.0, 3.0),
        ]);
        assert!(matches!(
            validate(&empty, false),
            Err(ValidationError::NestingViolation { .. })
        ));

        let early = ProgramRecord::from_spans([
            Span::closed("backtracer", 1.0, 5.0),
            Span::closed("app", 0.5, 3.0),
        ]);
        assert!(matches!(
            validate(&early, false),
            Err(ValidationError::NestingViolation { .. })
        ));
    }

    #[test]
    fn missing_backtracer_is_reported_first() {
        let record = ProgramRecord::from_spans([Span::closed("app", 2.0, 3.0)]);
        assert_eq!(validate(&record, true), Err(ValidationError::MissingBacktracer));

        let mut open = ProgramRecord::new();
        open.insert(Span {
            name: "backtracer".to_string(),
            start: Some(0.0),
            stop: None,
        });
        assert_eq!(validate(&open, false), Err(ValidationError::MissingBacktracer));
    }

    #[test]
    fn export_span_is_only_required_when_enabled() {
        let record = ProgramRecord::from_spans([
            Span::closed("backtracer", 0.0, 10.0),
            Span::closed("app", 2.0, 8.0),
        ]);
        validate(&record, false).expect("no export requested");
        assert_eq!(validate(&record, true), Err(ValidationError::MissingExport));
    }

    #[test]
    fn export_must_follow_backtracer() {
        let overlapping = ProgramRecord::from_spans([
            Span::closed("backtracer", 0.0, 10.0),
            Span::closed("bt-export", 9.0, 12.0),
        ]);
        let err = validate(&overlapping, true).expect_err("export overlaps backtracer");
        assert_eq!(
            err,
            ValidationError::ExportOrdering {
                bt_stop: 10.0,
                export_start: 9.0,
                export_stop: 12.0,
            }
        );
        validate(&overlapping, false).expect("export ordering unchecked when disabled");
    }

    #[test]
    fn open_program_span_is_rejected() {
        let mut record = ProgramRecord::from_spans([Span::closed("backtracer", 0.0, 10.0)]);
        record.insert(Span {
            name: "app".to_string(),
            start: Some(1.0),
            stop: None,
        });
        assert_eq!(
            validate(&record, false),
            Err(ValidationError::IncompleteSpan {
                span: "app".to_string(),
                missing: Boundary::Stop,
            })
        );
    }
}
