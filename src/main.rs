use bibsync::{
    Error, MergeOptions, MergeResult, MergeStatus, TiePreference, id, merge, store,
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bibsync",
    version,
    about = "Three-way merge of bibliography collections"
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Merge local and remote copies against their common ancestor
    Merge {
        /// Common ancestor; a missing file counts as an empty collection
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        local: PathBuf,
        #[arg(long)]
        remote: PathBuf,
        /// Side that wins when both revisions have the same timestamp
        #[arg(long, env = "BIBSYNC_PREFER_ON_TIE")]
        prefer_on_tie: Option<TiePreference>,
        /// Write the merged collection here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also replace the base with the merged collection
        #[arg(long)]
        advance_base: bool,
        /// Write outputs even with unresolved conflicts
        #[arg(long)]
        force: bool,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Give records without one a stable identity and timestamps
    Stamp {
        file: PathBuf,
        /// Write here instead of in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a shell completion script
    Completions { shell: Shell },
}

/// Exit status when the merge left conflicts unresolved.
const EXIT_CONFLICT: i32 = 2;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bibsync=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32, Error> {
    match cli.command {
        Cmd::Merge {
            base,
            local,
            remote,
            prefer_on_tie,
            output,
            advance_base,
            force,
            json,
        } => {
            let base_snap = store::load_or_empty(&base)?;
            let local_snap = store::load(&local)?;
            let remote_snap = store::load(&remote)?;
            let options = MergeOptions { prefer_on_tie };

            let result = merge(&base_snap, &local_snap, &remote_snap, &options);

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }

            let blocked = result.status == MergeStatus::Conflict && !force;
            if blocked && (output.is_some() || advance_base) {
                eprintln!(
                    "not writing: {} unresolved conflict(s); rerun with --prefer-on-tie or --force",
                    result.unresolved().count()
                );
            } else {
                // Keep stdout a single JSON document under --json
                let note = |msg: String| {
                    if json {
                        eprintln!("{msg}");
                    } else {
                        println!("{msg}");
                    }
                };
                let merged = result.merged_snapshot();
                if let Some(out) = output {
                    store::save(&out, &merged)?;
                    note(format!("wrote {}", out.display()));
                }
                if advance_base {
                    store::save(&base, &merged)?;
                    note(format!("advanced base {}", base.display()));
                }
            }

            Ok(exit_code(result.status))
        }
        Cmd::Stamp { file, output } => {
            let mut s = store::load(&file)?;
            let changed = id::stamp(&mut s, &id::now_timestamp());
            let target = output.unwrap_or(file);
            store::save(&target, &s)?;
            println!("stamped {changed} record(s) in {}", target.display());
            Ok(0)
        }
        Cmd::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "bibsync", &mut std::io::stdout());
            Ok(0)
        }
    }
}

fn exit_code(status: MergeStatus) -> i32 {
    match status {
        MergeStatus::Success | MergeStatus::AutoResolved => 0,
        MergeStatus::Conflict => EXIT_CONFLICT,
    }
}

fn print_summary(result: &MergeResult) {
    println!("status: {}", result.status);
    println!(
        "merged: {} record(s); added {} local, {} remote; deleted {} local, {} remote",
        result.merged.len(),
        result.local_only.len(),
        result.remote_only.len(),
        result.deleted_in_local.len(),
        result.deleted_in_remote.len(),
    );
    if result.conflicts.is_empty() {
        return;
    }
    println!("conflicts: {}", result.conflicts.len());
    for conflict in &result.conflicts {
        let label = conflict.short_id.as_deref().unwrap_or("-");
        println!(
            "  {} ({}) [{}] local {} / remote {}",
            label,
            conflict.identity,
            conflict.resolution,
            conflict.local_timestamp,
            conflict.remote_timestamp
        );
        for field in &conflict.fields {
            println!(
                "    {}: {} | {} -> {}",
                field.field,
                format_value(field.local.as_ref()),
                format_value(field.remote.as_ref()),
                format_value(field.resolved.as_ref())
            );
        }
    }
}

fn format_value(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "(absent)".to_string(),
    }
}
