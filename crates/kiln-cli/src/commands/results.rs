//! `kiln results` - inspect and compare persisted runs.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};

use kiln_harness::compare::compare_results;
use kiln_harness::results::ResultStore;

use super::OutputFormat;

/// Subcommands for inspecting persisted results.
#[derive(Subcommand)]
pub enum ResultsCommands {
    /// List persisted runs, newest first
    List(ListArgs),

    /// Compare the two most recent runs of an instance
    Compare(CompareArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Restrict to one instance id
    pub instance_id: Option<String>,

    /// Results directory
    #[arg(long, default_value = "test-results")]
    pub results_dir: PathBuf,
}

#[derive(Args)]
pub struct CompareArgs {
    /// Instance id whose runs to compare; omitted = latest two runs overall
    pub instance_id: Option<String>,

    /// Results directory
    #[arg(long, default_value = "test-results")]
    pub results_dir: PathBuf,
}

pub fn execute(cmd: ResultsCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ResultsCommands::List(args) => list(&args, format),
        ResultsCommands::Compare(args) => compare(&args, format),
    }
}

fn list(args: &ListArgs, format: OutputFormat) -> Result<()> {
    let store = ResultStore::new(&args.results_dir);
    let runs = store
        .list_runs(args.instance_id.as_deref())
        .context("listing runs")?;

    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = runs
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "instance_id": r.instance_id,
                        "stamp": r.stamp,
                        "path": r.path,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Quiet => {
            for run in &runs {
                println!("{}", run.path.display());
            }
        }
        OutputFormat::Table => {
            if runs.is_empty() {
                println!("no persisted runs");
                return Ok(());
            }
            println!("{:<12} {:<20} PATH", "INSTANCE", "STAMP");
            for run in &runs {
                println!(
                    "{:<12} {:<20} {}",
                    run.instance_id,
                    run.stamp,
                    run.path.display()
                );
            }
        }
    }
    Ok(())
}

fn compare(args: &CompareArgs, format: OutputFormat) -> Result<()> {
    let store = ResultStore::new(&args.results_dir);
    let runs = store
        .list_runs(args.instance_id.as_deref())
        .context("listing runs")?;
    if runs.len() < 2 {
        bail!(
            "need at least two persisted runs to compare, found {}",
            runs.len()
        );
    }

    // list_runs returns newest first.
    let current = store.load_file(&runs[0].path).context("loading current")?;
    let previous = store.load_file(&runs[1].path).context("loading previous")?;
    let comparison = compare_results(&current, &previous);

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&comparison)?);
        }
        OutputFormat::Quiet => {
            println!(
                "improved={} regressed={} new={} removed={}",
                comparison.improved, comparison.regressed, comparison.new, comparison.removed
            );
        }
        OutputFormat::Table => {
            println!(
                "comparing {} ({}) against {} ({})",
                runs[0].instance_id, runs[0].stamp, runs[1].instance_id, runs[1].stamp
            );
            println!(
                "total={} passed={} failed={} improved={} regressed={} new={} removed={}",
                comparison.total,
                comparison.passed,
                comparison.failed,
                comparison.improved,
                comparison.regressed,
                comparison.new,
                comparison.removed
            );
            println!("{:<14} {:<12} DURATION", "TEST", "STATUS");
            for detail in &comparison.details {
                let delta = detail
                    .duration_delta_ms
                    .map_or_else(|| "-".to_string(), |d| format!("{d:+}ms"));
                println!("{:<14} {:<12} {delta}", detail.test_name, detail.status.as_str());
            }
        }
    }
    Ok(())
}
