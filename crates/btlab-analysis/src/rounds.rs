//! Per-round measurements printed by instrumented programs in repeated-measurement mode.

use anyhow::{anyhow, Result};

/// Columns printed by the instrumented `measure_loop` header line.
pub const ROUND_COLUMNS: [&str; 8] = [
    "measure_round",
    "trace_interval",
    "init",
    "start",
    "stop",
    "duration",
    "btb_words",
    "program",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RoundTable {
    /// Builds a table from free-form measurement payloads.
    ///
    /// The first payload whose leading field is not a number is the header. Data rows seen before
    /// any header fall back to [`ROUND_COLUMNS`].
    pub fn from_payloads<S: AsRef<str>>(payloads: &[S]) -> Result<Self> {
        let mut table = RoundTable::default();
        for (idx, payload) in payloads.iter().enumerate() {
            let fields: Vec<String> = payload
                .as_ref()
                .split(',')
                .map(|f| f.trim().to_string())
                .collect();
            let is_header = fields
                .first()
                .map(|f| f.parse::<f64>().is_err())
                .unwrap_or(false);
            if is_header {
                if table.header.is_empty() && table.rows.is_empty() {
                    table.header = fields;
                    continue;
                }
                // repeated header, one per trace interval
                if fields == table.header {
                    continue;
                }
                return Err(anyhow!(
                    "measurement line {} changes the header to {:?}, expected {:?}",
                    idx + 1,
                    fields,
                    table.header
                ));
            }
            if table.header.is_empty() {
                table.header = ROUND_COLUMNS.iter().map(|c| c.to_string()).collect();
            }
            if fields.len() != table.header.len() {
                return Err(anyhow!(
                    "measurement line {} has {} fields, header has {}: {:?}",
                    idx + 1,
                    fields.len(),
                    table.header.len(),
                    payload.as_ref()
                ));
            }
            table.rows.push(fields);
        }
        Ok(table)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
