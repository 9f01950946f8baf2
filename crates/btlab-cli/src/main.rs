use anyhow::Result;
use btlab_analysis::{merge, summary_lines, write_dataset, RoundTable, RunRecord};
use btlab_core::{extract_reader, validate, ExtractOptions, RunKey, TimestampRadix};
use btlab_runner::{BatchResult, MakeHarness, PlanSummary, RadixSetting, RunStatus};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::{self, BufReader};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "btlab", version = "0.3.0", about = "Backtracer measurement runs and timespan datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract and validate the spans of one cleaned log.
    Extract {
        log: PathBuf,
        /// Require the bt-export span and check its ordering.
        #[arg(long)]
        export: bool,
        /// Always read span timestamps as hexadecimal.
        #[arg(long)]
        hex_timestamps: bool,
        #[arg(long, default_value_t = 0.0)]
        trace_interval: f64,
        #[arg(long, default_value = "adhoc")]
        label: String,
        /// Also write the single-run dataset to this CSV file.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        plan: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Run {
        plan: PathBuf,
        #[arg(long)]
        continue_on_failure: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Extract {
            log,
            export,
            hex_timestamps,
            trace_interval,
            label,
            out,
            json,
        } => {
            let options = ExtractOptions {
                radix: if hex_timestamps {
                    TimestampRadix::Hex
                } else {
                    TimestampRadix::Infer
                },
            };
            let program = log
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("program")
                .to_string();
            let file = std::fs::File::open(&log)
                .map_err(|e| anyhow::anyhow!("failed to open {}: {}", log.display(), e))?;
            let extraction = extract_reader(BufReader::new(file), options)?;
            validate(&extraction.record, export)?;
            let run = RunRecord {
                key: RunKey::new(trace_interval, program),
                configuration_label: label,
                rounds: RoundTable::from_payloads(&extraction.measurement_lines)?,
                record: extraction.record,
            };
            let dataset = merge([&run]);
            if let Some(path) = &out {
                write_dataset(&dataset, path)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "extract",
                    "log": log.display().to_string(),
                    "spans": dataset.rows().iter().map(|r| json!({
                        "name": r.span_name,
                        "start": r.start,
                        "stop": r.stop,
                        "duration": r.duration,
                    })).collect::<Vec<_>>(),
                    "btb_words": run.record.btb_words,
                    "export_anomalies": extraction.anomalies.len(),
                    "measurement_rounds": run.rounds.rows.len(),
                    "out": out.map(|p| p.display().to_string()),
                })));
            }
            for line in summary_lines(&dataset) {
                println!("{}", line);
            }
        }
        Commands::Describe { plan, json } => {
            let plan = btlab_runner::load_plan(&plan)?;
            let summary = btlab_runner::describe_plan(&plan)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": plan_summary_to_json(&summary),
                })));
            }
            print_plan_summary(&summary);
        }
        Commands::Run {
            plan,
            continue_on_failure,
            json,
        } => {
            let mut plan = btlab_runner::load_plan(&plan)?;
            plan.continue_on_failure |= continue_on_failure;
            let summary = btlab_runner::describe_plan(&plan)?;
            let harness = MakeHarness::from_plan(&plan);
            let result = btlab_runner::run_batch(&plan, &harness)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": plan_summary_to_json(&summary),
                    "batch": batch_result_to_json(&result),
                })));
            }
            println!("batch_id: {}", result.batch_id);
            println!("dataset: {}", result.dataset_path.display());
            if let Some(path) = &result.rounds_path {
                println!("rounds: {}", path.display());
            }
            println!("manifest: {}", result.manifest_path.display());
            println!("runs: {} ({} failed)", result.runs.len(), result.failed());
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Extract { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Run { json, .. } => *json,
    }
}

fn plan_summary_to_json(summary: &PlanSummary) -> Value {
    json!({
        "target": summary.target.as_str(),
        "data_dir": summary.data_dir.display().to_string(),
        "programs": summary.programs,
        "configurations": summary.configurations.iter().map(|c| json!({
            "label": c.label,
            "trace_interval": c.trace_interval,
            "export": c.export,
            "harness_args": c.harness_args,
        })).collect::<Vec<_>>(),
        "total_runs": summary.total_runs,
        "harness": summary.harness_command,
        "export": summary.export,
        "timestamp_radix": summary.timestamp_radix.as_str(),
        "continue_on_failure": summary.continue_on_failure,
    })
}

fn print_plan_summary(summary: &PlanSummary) {
    println!("target: {}", summary.target.as_str());
    println!("data_dir: {}", summary.data_dir.display());
    println!("programs: {}", summary.programs.join(", "));
    println!("configurations: {}", summary.configurations.len());
    for c in &summary.configurations {
        println!("  {} (trace_interval={} s)", c.label, c.trace_interval);
    }
    println!("total_runs: {}", summary.total_runs);
    println!("harness: {:?}", summary.harness_command);
    println!("export: {}", summary.export);
    match summary.timestamp_radix {
        RadixSetting::Infer => println!(
            "timestamp_radix: infer (all-digit stamps read as decimal; logs from the measure harness need `timestamp_radix: hex`)"
        ),
        RadixSetting::Hex => println!("timestamp_radix: hex"),
    }
    println!("continue_on_failure: {}", summary.continue_on_failure);
}

fn batch_result_to_json(result: &BatchResult) -> Value {
    json!({
        "batch_id": result.batch_id,
        "dataset": result.dataset_path.display().to_string(),
        "rows": result.dataset.len(),
        "rounds": result.rounds_path.as_ref().map(|p| p.display().to_string()),
        "manifest": result.manifest_path.display().to_string(),
        "runs": result.runs.iter().map(|r| json!({
            "configuration_label": r.label,
            "program": r.program,
            "status": match &r.status {
                RunStatus::Completed => "completed",
                RunStatus::Failed(_) => "failed",
            },
            "error": match &r.status {
                RunStatus::Failed(msg) => Some(msg.as_str()),
                RunStatus::Completed => None,
            },
        })).collect::<Vec<_>>(),
        "failed": result.failed(),
    })
}
