//! Folds validated per-run records into one dataset and writes it as CSV.

pub mod rounds;

use anyhow::{anyhow, Result};
use btlab_core::{atomic_write_bytes, ProgramRecord, RunKey};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::info;

pub use rounds::{RoundTable, ROUND_COLUMNS};

pub const ROUND_PROVENANCE_COLUMNS: [&str; 2] = ["configuration_label", "run_program"];

pub const DATASET_COLUMNS: [&str; 8] = [
    "trace_interval",
    "program",
    "span_name",
    "start",
    "stop",
    "duration",
    "configuration_label",
    "export_word_count",
];

/// One validated run, ready to be merged.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub key: RunKey,
    pub configuration_label: String,
    pub record: ProgramRecord,
    pub rounds: RoundTable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRow {
    pub trace_interval: f64,
    pub program: String,
    pub span_name: String,
    pub start: f64,
    pub stop: f64,
    pub duration: f64,
    pub configuration_label: String,
    pub export_word_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementDataset {
    rows: Vec<MeasurementRow>,
}

impl MeasurementDataset {
    pub fn rows(&self) -> &[MeasurementRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for row in &self.rows {
            if !labels.contains(&row.configuration_label.as_str()) {
                labels.push(&row.configuration_label);
            }
        }
        labels
    }
}

/// Flattens runs into rows, keeping run order and first-seen span order.
///
/// Spans still missing a boundary are skipped; records are expected to be validated already.
pub fn merge<'a>(runs: impl IntoIterator<Item = &'a RunRecord>) -> MeasurementDataset {
    let rows = runs
        .into_iter()
        .flat_map(|run| {
            run.record.spans().iter().filter_map(move |span| {
                let (start, stop) = span.bounds()?;
                Some(MeasurementRow {
                    trace_interval: run.key.trace_interval,
                    program: run.key.program.clone(),
                    span_name: span.name.clone(),
                    start,
                    stop,
                    duration: stop - start,
                    configuration_label: run.configuration_label.clone(),
                    export_word_count: run.record.btb_words,
                })
            })
        })
        .collect();
    MeasurementDataset { rows }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundDataset {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RoundDataset {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Concatenates the round tables of all runs, prefixed with [`ROUND_PROVENANCE_COLUMNS`].
///
/// The measurement header already carries a `program` column, so the run's own program goes into
/// `run_program`.
pub fn merge_rounds<'a>(runs: impl IntoIterator<Item = &'a RunRecord>) -> Result<RoundDataset> {
    let mut table_header: Option<&[String]> = None;
    let mut rows = Vec::new();
    for run in runs {
        if run.rounds.is_empty() {
            continue;
        }
        match table_header {
            None => table_header = Some(run.rounds.header.as_slice()),
            Some(h) if h != run.rounds.header.as_slice() => {
                return Err(anyhow!(
                    "round table of {} ({}) has header {:?}, expected {:?}",
                    run.key.program,
                    run.configuration_label,
                    run.rounds.header,
                    h
                ));
            }
            Some(_) => {}
        }
        for row in &run.rounds.rows {
            let mut out = Vec::with_capacity(row.len() + 2);
            out.push(run.configuration_label.clone());
            out.push(run.key.program.clone());
            out.extend(row.iter().cloned());
            rows.push(out);
        }
    }
    let header = match table_header {
        Some(h) => ROUND_PROVENANCE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(h.iter().cloned())
            .collect(),
        None => Vec::new(),
    };
    Ok(RoundDataset { header, rows })
}

pub fn write_dataset_to<W: Write>(dataset: &MeasurementDataset, writer: W) -> Result<()> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv_writer.write_record(DATASET_COLUMNS)?;
    for row in dataset.rows() {
        csv_writer.serialize(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_dataset(dataset: &MeasurementDataset, path: &Path) -> Result<()> {
    let mut bytes = Vec::new();
    write_dataset_to(dataset, &mut bytes)?;
    atomic_write_bytes(path, &bytes)?;
    info!(path = %path.display(), rows = dataset.len(), "wrote dataset");
    Ok(())
}

pub fn write_rounds_to<W: Write>(rounds: &RoundDataset, writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(&rounds.header)?;
    for row in &rounds.rows {
        csv_writer.write_record(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_rounds(rounds: &RoundDataset, path: &Path) -> Result<()> {
    let mut bytes = Vec::new();
    write_rounds_to(rounds, &mut bytes)?;
    atomic_write_bytes(path, &bytes)?;
    info!(path = %path.display(), rows = rounds.rows.len(), "wrote round table");
    Ok(())
}

/// Human-readable lines, rounded to 6 decimals. Never used for the persisted dataset.
pub fn summary_lines(dataset: &MeasurementDataset) -> Vec<String> {
    dataset
        .rows()
        .iter()
        .map(|row| {
            let words = row
                .export_word_count
                .map(|w| format!(", {} words", w))
                .unwrap_or_default();
            format!(
                "{:>9.6} s [{}] {:20}: {:20} ran {:12.6} .. {:12.6} -> {:12.6}{}",
                row.trace_interval,
                row.configuration_label,
                row.program,
                row.span_name,
                row.start,
                row.stop,
                row.duration,
                words
            )
        })
        .collect()
}
