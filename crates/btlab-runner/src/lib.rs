use anyhow::{anyhow, Result};
use btlab_analysis::{
    merge, merge_rounds, summary_lines, write_dataset, write_rounds, MeasurementDataset,
    RoundTable, RunRecord,
};
use btlab_core::{
    atomic_write_bytes, ensure_dir, extract_reader, sha256_file, validate, ExportAnomaly,
    ExtractOptions, ExtractionError, RunKey, TimestampRadix, ValidationError,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

pub const DATASET_FILE: &str = "timespans.csv";
pub const ROUNDS_FILE: &str = "rounds.csv";
pub const MANIFEST_FILE: &str = "batch_manifest.json";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("using target '{0}' (i.e. pxe-boot) is not yet implemented")]
    UnsupportedTarget(&'static str),
    #[error("batch plan requests no programs")]
    NoPrograms,
    #[error("batch plan has neither trace intervals nor variants")]
    NoConfigurations,
    #[error("trace interval {0} s is not a non-negative number")]
    InvalidInterval(f64),
    #[error("harness command is empty")]
    EmptyHarnessCommand,
    #[error("configurations '{first}' and '{second}' would share the log directory '{dir}'")]
    DuplicateLabel {
        first: String,
        second: String,
        dir: String,
    },
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("`{command}` exited with status {status}")]
    Exit { command: String, status: String },
    #[error("`{command}` could not be started: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("harness finished but left no log at {}", path.display())]
    MissingArtifact { path: PathBuf },
    #[error("harness command is empty")]
    EmptyCommand,
}

/// A failed run, always tagged with its `(configuration_label, program)`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run ({label}, {program}): {source}")]
    Collaborator {
        label: String,
        program: String,
        #[source]
        source: CollaboratorError,
    },
    #[error("run ({label}, {program}): {source}")]
    Extraction {
        label: String,
        program: String,
        #[source]
        source: ExtractionError,
    },
    #[error("run ({label}, {program}): {source}")]
    Validation {
        label: String,
        program: String,
        #[source]
        source: ValidationError,
    },
    #[error("run ({label}, {program}): {message}")]
    Rounds {
        label: String,
        program: String,
        message: String,
    },
    #[error("run ({label}, {program}): cannot prepare {}: {source}", path.display())]
    Io {
        label: String,
        program: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    pub fn key(&self) -> (&str, &str) {
        match self {
            RunError::Collaborator { label, program, .. }
            | RunError::Extraction { label, program, .. }
            | RunError::Validation { label, program, .. }
            | RunError::Rounds { label, program, .. }
            | RunError::Io { label, program, .. } => (label.as_str(), program.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    Qemu,
    Erwin,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Qemu => "qemu",
            Target::Erwin => "erwin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadixSetting {
    #[default]
    Infer,
    Hex,
}

impl RadixSetting {
    pub fn as_str(self) -> &'static str {
        match self {
            RadixSetting::Infer => "infer",
            RadixSetting::Hex => "hex",
        }
    }
}

impl From<RadixSetting> for TimestampRadix {
    fn from(value: RadixSetting) -> Self {
        match value {
            RadixSetting::Infer => TimestampRadix::Infer,
            RadixSetting::Hex => TimestampRadix::Hex,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessSpec {
    #[serde(default = "default_harness_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl Default for HarnessSpec {
    fn default() -> Self {
        Self {
            command: default_harness_command(),
            workdir: None,
        }
    }
}

/// A build variant measured next to the trace intervals, e.g. a kernel without the debugger.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantSpec {
    pub label: String,
    #[serde(default)]
    pub trace_interval: f64,
    #[serde(default)]
    pub harness_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchPlan {
    #[serde(default)]
    pub target: Target,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_programs")]
    pub programs: Vec<String>,
    #[serde(default = "default_trace_intervals")]
    pub trace_intervals: Vec<f64>,
    #[serde(default)]
    pub export: bool,
    /// `infer` reads all-digit stamps as decimal. The measure harness prints bare `%16llx`
    /// stamps, so plans driving it should set `hex`.
    #[serde(default)]
    pub timestamp_radix: RadixSetting,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub harness: HarnessSpec,
    #[serde(default)]
    pub variants: Vec<VariantSpec>,
}

fn default_harness_command() -> Vec<String> {
    vec!["make".to_string(), "-f".to_string(), "External.make".to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_programs() -> Vec<String> {
    ["qsort", "hello", "stress_malloc", "stress_rng", "stress_vfs"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_trace_intervals() -> Vec<f64> {
    vec![0.001, 0.002, 0.005, 0.010, 0.020, 0.040, 0.080]
}

impl BatchPlan {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Rejects plans that cannot run at all, before any harness invocation.
    pub fn check(&self) -> Result<(), ConfigurationError> {
        if self.target == Target::Erwin {
            return Err(ConfigurationError::UnsupportedTarget(self.target.as_str()));
        }
        if self.programs.is_empty() {
            return Err(ConfigurationError::NoPrograms);
        }
        if self.trace_intervals.is_empty() && self.variants.is_empty() {
            return Err(ConfigurationError::NoConfigurations);
        }
        let intervals = self
            .trace_intervals
            .iter()
            .chain(self.variants.iter().map(|v| &v.trace_interval));
        for interval in intervals {
            if !interval.is_finite() || *interval < 0.0 {
                return Err(ConfigurationError::InvalidInterval(*interval));
            }
        }
        if self.harness.command.is_empty() {
            return Err(ConfigurationError::EmptyHarnessCommand);
        }
        let mut dirs: BTreeMap<String, String> = BTreeMap::new();
        for configuration in self.configurations() {
            let dir = path_label(&configuration.label);
            if let Some(first) = dirs.get(&dir) {
                return Err(ConfigurationError::DuplicateLabel {
                    first: first.clone(),
                    second: configuration.label,
                    dir,
                });
            }
            dirs.insert(dir, configuration.label);
        }
        Ok(())
    }

    /// Trace intervals first, then variants, both in plan order.
    pub fn configurations(&self) -> Vec<Configuration> {
        let mut out: Vec<Configuration> = self
            .trace_intervals
            .iter()
            .map(|&interval| Configuration::for_interval(interval, self.export))
            .collect();
        out.extend(self.variants.iter().map(|v| Configuration {
            label: v.label.clone(),
            trace_interval: v.trace_interval,
            export: self.export,
            harness_args: v.harness_args.clone(),
        }));
        out
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            radix: self.timestamp_radix.into(),
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.data_dir.is_relative() {
            self.data_dir = base.join(&self.data_dir);
        }
        let workdir = match self.harness.workdir.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        };
        self.harness.workdir = Some(workdir);
    }
}

/// Loads a YAML plan; relative paths are resolved against the plan's directory.
pub fn load_plan(path: &Path) -> Result<BatchPlan> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read batch plan {}: {}", path.display(), e))?;
    let mut plan = BatchPlan::from_yaml(&raw)?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    plan.resolve_paths(&base);
    Ok(plan)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub label: String,
    pub trace_interval: f64,
    pub export: bool,
    pub harness_args: Vec<String>,
}

impl Configuration {
    pub fn for_interval(trace_interval: f64, export: bool) -> Self {
        Self {
            label: format!("measure{}us", interval_micros(trace_interval)),
            trace_interval,
            export,
            harness_args: Vec::new(),
        }
    }
}

pub fn interval_micros(trace_interval: f64) -> u64 {
    (trace_interval * 1_000_000.0).round() as u64
}

/// Directory-safe form of a configuration label, also passed to make as `LABEL`.
pub fn path_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn log_path(data_dir: &Path, label: &str, program: &str) -> PathBuf {
    data_dir
        .join(path_label(label))
        .join(format!("{}.cleaned", program))
}

/// The external build/execution step producing one raw log.
pub trait Harness {
    fn produce_log(
        &self,
        configuration: &Configuration,
        program: &str,
        log_path: &Path,
    ) -> Result<(), CollaboratorError>;
}

/// Runs `make -f External.make LABEL=<label> <target>` (or the configured command).
#[derive(Debug, Clone)]
pub struct MakeHarness {
    pub command: Vec<String>,
    pub workdir: PathBuf,
}

impl MakeHarness {
    pub fn new(command: Vec<String>, workdir: PathBuf) -> Self {
        Self { command, workdir }
    }

    pub fn from_plan(plan: &BatchPlan) -> Self {
        Self::new(
            plan.harness.command.clone(),
            plan.harness
                .workdir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
        )
    }

    /// With export enabled the raw `.log` target is built; make derives the `.cleaned` log from it.
    pub fn command_line(&self, configuration: &Configuration, log_path: &Path) -> Vec<String> {
        let target = if configuration.export {
            log_path.with_extension("log")
        } else {
            log_path.to_path_buf()
        };
        let target = target
            .strip_prefix(&self.workdir)
            .map(Path::to_path_buf)
            .unwrap_or(target);
        let mut parts = self.command.clone();
        parts.push(format!("LABEL={}", path_label(&configuration.label)));
        parts.extend(configuration.harness_args.iter().cloned());
        parts.push(target.to_string_lossy().to_string());
        parts
    }
}

impl Harness for MakeHarness {
    fn produce_log(
        &self,
        configuration: &Configuration,
        program: &str,
        log_path: &Path,
    ) -> Result<(), CollaboratorError> {
        if self.command.is_empty() {
            return Err(CollaboratorError::EmptyCommand);
        }
        let parts = self.command_line(configuration, log_path);
        let Some((program_name, args)) = parts.split_first() else {
            return Err(CollaboratorError::EmptyCommand);
        };
        let command = shell_join(&parts);
        info!(%command, program, "invoking harness");
        let status = Command::new(program_name)
            .args(args)
            .current_dir(&self.workdir)
            .status()
            .map_err(|source| CollaboratorError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !status.success() {
            return Err(CollaboratorError::Exit {
                command,
                status: status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
            });
        }
        Ok(())
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run: RunRecord,
    pub log_path: PathBuf,
    pub anomalies: Vec<ExportAnomaly>,
}

/// Drives one (program, configuration) run: harness, extraction, validation.
pub struct RunDriver<'h> {
    harness: &'h dyn Harness,
    data_dir: PathBuf,
    options: ExtractOptions,
}

impl<'h> RunDriver<'h> {
    pub fn new(harness: &'h dyn Harness, data_dir: &Path, options: ExtractOptions) -> Self {
        Self {
            harness,
            data_dir: data_dir.to_path_buf(),
            options,
        }
    }

    pub fn log_path(&self, configuration: &Configuration, program: &str) -> PathBuf {
        log_path(&self.data_dir, &configuration.label, program)
    }

    pub fn run(&self, program: &str, configuration: &Configuration) -> Result<RunOutput, RunError> {
        let label = configuration.label.clone();
        let log_path = self.log_path(configuration, program);
        let collaborator = |source: CollaboratorError| RunError::Collaborator {
            label: label.clone(),
            program: program.to_string(),
            source,
        };
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).map_err(|source| RunError::Io {
                label: label.clone(),
                program: program.to_string(),
                path: parent.to_path_buf(),
                source,
            })?;
        }
        self.harness
            .produce_log(configuration, program, &log_path)
            .map_err(collaborator)?;
        let file = fs::File::open(&log_path).map_err(|_| {
            collaborator(CollaboratorError::MissingArtifact {
                path: log_path.clone(),
            })
        })?;

        let extraction = extract_reader(BufReader::new(file), self.options).map_err(|source| {
            RunError::Extraction {
                label: label.clone(),
                program: program.to_string(),
                source,
            }
        })?;
        validate(&extraction.record, configuration.export).map_err(|source| {
            RunError::Validation {
                label: label.clone(),
                program: program.to_string(),
                source,
            }
        })?;
        let rounds = RoundTable::from_payloads(&extraction.measurement_lines).map_err(|e| {
            RunError::Rounds {
                label: label.clone(),
                program: program.to_string(),
                message: e.to_string(),
            }
        })?;

        info!(
            label = %label,
            program,
            spans = extraction.record.len(),
            rounds = rounds.rows.len(),
            btb_words = ?extraction.record.btb_words,
            "run completed"
        );
        Ok(RunOutput {
            run: RunRecord {
                key: RunKey::new(configuration.trace_interval, program),
                configuration_label: label,
                record: extraction.record,
                rounds,
            },
            log_path,
            anomalies: extraction.anomalies,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub target: Target,
    pub data_dir: PathBuf,
    pub programs: Vec<String>,
    pub configurations: Vec<Configuration>,
    pub total_runs: usize,
    pub harness_command: Vec<String>,
    pub export: bool,
    pub timestamp_radix: RadixSetting,
    pub continue_on_failure: bool,
}

pub fn describe_plan(plan: &BatchPlan) -> Result<PlanSummary> {
    plan.check()?;
    let configurations = plan.configurations();
    Ok(PlanSummary {
        target: plan.target,
        data_dir: plan.data_dir.clone(),
        programs: plan.programs.clone(),
        total_runs: configurations.len() * plan.programs.len(),
        configurations,
        harness_command: plan.harness.command.clone(),
        export: plan.export,
        timestamp_radix: plan.timestamp_radix,
        continue_on_failure: plan.continue_on_failure,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub label: String,
    pub program: String,
    pub trace_interval: f64,
    pub log_path: PathBuf,
    pub status: RunStatus,
    pub anomalies: usize,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: String,
    pub dataset: MeasurementDataset,
    pub dataset_path: PathBuf,
    pub rounds_path: Option<PathBuf>,
    pub manifest_path: PathBuf,
    pub runs: Vec<RunSummary>,
}

impl BatchResult {
    pub fn failed(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| matches!(r.status, RunStatus::Failed(_)))
            .count()
    }
}

/// Runs every (configuration, program) pair in order and writes the merged dataset.
///
/// The first failed run aborts the batch unless `continue_on_failure` is set, in which case the
/// failed run is left out of the dataset and recorded in the manifest.
pub fn run_batch(plan: &BatchPlan, harness: &dyn Harness) -> Result<BatchResult> {
    plan.check()?;
    let batch_id = format!("batch_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let created_at = Utc::now().to_rfc3339();
    ensure_dir(&plan.data_dir)?;
    let manifest_path = plan.data_dir.join(MANIFEST_FILE);
    let driver = RunDriver::new(harness, &plan.data_dir, plan.extract_options());

    let mut records: Vec<RunRecord> = Vec::new();
    let mut summaries: Vec<RunSummary> = Vec::new();
    for configuration in plan.configurations() {
        for program in &plan.programs {
            info!(
                label = %configuration.label,
                program = %program,
                trace_interval = configuration.trace_interval,
                "starting run"
            );
            match driver.run(program, &configuration) {
                Ok(output) => {
                    summaries.push(RunSummary {
                        label: configuration.label.clone(),
                        program: program.clone(),
                        trace_interval: configuration.trace_interval,
                        log_path: output.log_path,
                        status: RunStatus::Completed,
                        anomalies: output.anomalies.len(),
                    });
                    records.push(output.run);
                }
                Err(err) => {
                    summaries.push(RunSummary {
                        label: configuration.label.clone(),
                        program: program.clone(),
                        trace_interval: configuration.trace_interval,
                        log_path: driver.log_path(&configuration, program),
                        status: RunStatus::Failed(err.to_string()),
                        anomalies: 0,
                    });
                    if !plan.continue_on_failure {
                        write_manifest(
                            &manifest_path,
                            &batch_id,
                            &created_at,
                            "failed",
                            &summaries,
                            None,
                        )?;
                        return Err(err.into());
                    }
                    warn!(error = %err, "run failed, continuing with the next one");
                }
            }
        }
    }

    let dataset = merge(&records);
    for line in summary_lines(&dataset) {
        info!("{}", line);
    }
    let dataset_path = plan.data_dir.join(DATASET_FILE);
    write_dataset(&dataset, &dataset_path)?;

    let rounds = merge_rounds(&records)?;
    let rounds_path = if rounds.is_empty() {
        None
    } else {
        let path = plan.data_dir.join(ROUNDS_FILE);
        write_rounds(&rounds, &path)?;
        Some(path)
    };

    let status = if summaries.iter().any(|s| s.status != RunStatus::Completed) {
        "completed_with_failures"
    } else {
        "completed"
    };
    write_manifest(
        &manifest_path,
        &batch_id,
        &created_at,
        status,
        &summaries,
        Some(&dataset_path),
    )?;

    Ok(BatchResult {
        batch_id,
        dataset,
        dataset_path,
        rounds_path,
        manifest_path,
        runs: summaries,
    })
}

fn write_manifest(
    path: &Path,
    batch_id: &str,
    created_at: &str,
    status: &str,
    runs: &[RunSummary],
    dataset_path: Option<&Path>,
) -> Result<()> {
    let runs: Vec<Value> = runs
        .iter()
        .map(|r| {
            let (status, error) = match &r.status {
                RunStatus::Completed => ("completed", None),
                RunStatus::Failed(msg) => ("failed", Some(msg.as_str())),
            };
            json!({
                "configuration_label": r.label,
                "program": r.program,
                "trace_interval": r.trace_interval,
                "log_path": r.log_path.display().to_string(),
                "log_sha256": sha256_file(&r.log_path).ok(),
                "status": status,
                "error": error,
                "export_anomalies": r.anomalies,
            })
        })
        .collect();
    let dataset = match dataset_path {
        Some(p) => json!({
            "path": p.display().to_string(),
            "sha256": sha256_file(p)?,
        }),
        None => Value::Null,
    };
    let manifest = json!({
        "schema_version": "batch_manifest_v1",
        "batch_id": batch_id,
        "created_at": created_at,
        "finished_at": Utc::now().to_rfc3339(),
        "status": status,
        "runs": runs,
        "dataset": dataset,
    });
    atomic_write_bytes(path, &serde_json::to_vec_pretty(&manifest)?)
}
