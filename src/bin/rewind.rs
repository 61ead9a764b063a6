//! # rewind CLI - checkpoints for working directories
//!
//! Command-line front end for the rewind engine.
//!
//! ## Usage
//! ```bash
//! # Initialize storage for the current directory
//! rewind init
//!
//! # Create a checkpoint
//! rewind checkpoint -m "Initial state"
//!
//! # List the session's history
//! rewind list
//!
//! # Restore to a checkpoint (unique id prefixes work)
//! rewind restore 3f2a9c1e
//!
//! # Compare checkpoints with line-level diff
//! rewind diff <from-id> <to-id> --lines
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use rewind::types::{default_ignore_patterns, DiffOptions, LineChange};
use rewind::{
    format_bytes, ApplyObserver, CancelToken, Change, Checkpoint, CompressionStrategy, DeltaSet, LineDetail,
    RestoreOptions, Rewind, RewindError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Checkpoint, browse, diff and restore directory states
#[derive(Parser)]
#[command(name = "rewind")]
#[command(version)]
#[command(about = "Checkpoint, browse, diff and restore directory states")]
#[command(long_about = None)]
struct Cli {
    /// Working directory (defaults to current)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Storage directory (defaults to <path>/.rewind)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// Session the working directory belongs to
    #[arg(long, global = true, default_value = "default")]
    session: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize storage
    Init {
        /// Compression strategy
        #[arg(long, value_enum, default_value = "fast")]
        compression: CompressionMode,

        /// Extra ignore globs
        #[arg(short, long)]
        ignore: Vec<String>,
    },

    /// Create a checkpoint
    #[command(alias = "cp")]
    Checkpoint {
        /// Checkpoint message
        #[arg(short, long, default_value = "checkpoint")]
        message: String,

        /// Show a spinner while capturing
        #[arg(long)]
        progress: bool,
    },

    /// Restore to a checkpoint
    #[command(alias = "rs")]
    Restore {
        /// Checkpoint id or unique prefix
        checkpoint: String,

        /// Only show what would change
        #[arg(long)]
        dry_run: bool,

        /// Show a spinner while restoring
        #[arg(long)]
        progress: bool,
    },

    /// List checkpoints in creation order
    #[command(alias = "ls")]
    List {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,

        /// Limit results
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the history tree
    #[command(alias = "tl")]
    Timeline,

    /// Restore to a checkpoint and start a branch from it
    Fork {
        /// Checkpoint to fork from
        checkpoint: String,

        /// Fork message
        #[arg(short, long, default_value = "fork")]
        message: String,
    },

    /// Compare two checkpoints
    Diff {
        /// From checkpoint
        from: String,

        /// To checkpoint
        to: String,

        /// Show line-level differences
        #[arg(short, long)]
        lines: bool,

        /// Context lines around each change
        #[arg(long, default_value = "3")]
        context: usize,

        /// Show only statistics
        #[arg(long)]
        stat: bool,

        /// Ignore whitespace changes
        #[arg(long)]
        ignore_whitespace: bool,
    },

    /// Verify integrity
    Verify {
        /// Checkpoint to verify (defaults to current)
        checkpoint: Option<String>,

        /// Verify the whole session
        #[arg(long)]
        all: bool,
    },

    /// Quarantine corrupted objects
    Repair,

    /// Delete content no session references
    #[command(name = "gc")]
    GarbageCollect {
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the current checkpoint and uncommitted changes
    Status,

    /// Show checkpoint details
    Info {
        /// Checkpoint id or unique prefix
        checkpoint: String,
    },

    /// List registered sessions
    Sessions,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompressionMode {
    None,
    Fast,
    Adaptive,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        if let Some(err) = e.downcast_ref::<RewindError>() {
            eprintln!("{}", err.user_message().dimmed());
        }
        std::process::exit(1);
    }
}

struct Workspace {
    root: PathBuf,
    storage: PathBuf,
    session: String,
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let storage = cli.storage.unwrap_or_else(|| root.join(".rewind"));
    let ctx = Workspace {
        root,
        storage,
        session: cli.session,
    };

    match cli.command {
        Commands::Init { compression, ignore } => cmd_init(&ctx, compression, ignore),
        Commands::Checkpoint { message, progress } => cmd_checkpoint(&ctx, &message, progress),
        Commands::Restore {
            checkpoint,
            dry_run,
            progress,
        } => cmd_restore(&ctx, &checkpoint, dry_run, progress),
        Commands::List { detailed, limit } => cmd_list(&ctx, detailed, limit),
        Commands::Timeline => cmd_timeline(&ctx),
        Commands::Fork { checkpoint, message } => cmd_fork(&ctx, &checkpoint, &message),
        Commands::Diff {
            from,
            to,
            lines,
            context,
            stat,
            ignore_whitespace,
        } => {
            let options = DiffOptions {
                context_lines: context,
                ignore_whitespace,
                ..Default::default()
            };
            cmd_diff(&ctx, &from, &to, lines, stat, &options)
        }
        Commands::Verify { checkpoint, all } => cmd_verify(&ctx, checkpoint, all),
        Commands::Repair => cmd_repair(&ctx),
        Commands::GarbageCollect { dry_run } => cmd_gc(&ctx, dry_run),
        Commands::Status => cmd_status(&ctx),
        Commands::Info { checkpoint } => cmd_info(&ctx, &checkpoint),
        Commands::Sessions => cmd_sessions(&ctx),
    }
}

/// Open the storage and make sure the session points at `--path`
fn open_engine(ctx: &Workspace) -> Result<Rewind> {
    let engine = Rewind::open(&ctx.storage)
        .with_context(|| format!("opening storage at {}", ctx.storage.display()))?;
    engine
        .register_session(&ctx.session, &ctx.root)
        .with_context(|| format!("registering session '{}'", ctx.session))?;
    Ok(engine)
}

fn spinner(enabled: bool, message: &'static str) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

fn cmd_init(ctx: &Workspace, compression: CompressionMode, ignore: Vec<String>) -> Result<()> {
    if ctx.storage.join("metadata.json").exists() {
        bail!("{} is already initialized", ctx.storage.display());
    }
    println!("{}", "Initializing rewind...".blue().bold());

    let strategy = match compression {
        CompressionMode::None => CompressionStrategy::None,
        CompressionMode::Fast => CompressionStrategy::Fast,
        CompressionMode::Adaptive => CompressionStrategy::adaptive(),
    };
    let mut patterns = default_ignore_patterns();
    patterns.extend(ignore);

    let engine = Rewind::builder()
        .compression_strategy(strategy)
        .ignore_patterns(patterns)
        .build(&ctx.storage)
        .with_context(|| format!("initializing storage at {}", ctx.storage.display()))?;
    engine.register_session(&ctx.session, &ctx.root)?;

    println!("{} Initialized rewind storage", "✓".green().bold());
    println!("  Root: {}", ctx.root.display().to_string().cyan());
    println!("  Storage: {}", engine.storage_path().display().to_string().cyan());
    println!("  Session: {}", ctx.session.cyan());
    println!("\nNext steps:");
    println!("  - Create your first checkpoint: {}", "rewind checkpoint -m \"Initial state\"".yellow());
    println!("  - View history: {}", "rewind timeline".yellow());
    Ok(())
}

fn cmd_checkpoint(ctx: &Workspace, message: &str, progress: bool) -> Result<()> {
    let engine = open_engine(ctx)?;
    println!("{}", "Creating checkpoint...".blue().bold());

    let start = Instant::now();
    let pb = spinner(progress, "Capturing files...");
    let result = engine.checkpoint_with(&ctx.session, message, &CancelToken::new());
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let snapshot = result.context("creating checkpoint")?;
    let checkpoint = &snapshot.checkpoint;

    println!("{} Created checkpoint {}", "✓".green().bold(), checkpoint.short_id().yellow().bold());
    println!("  Message: {}", checkpoint.message.cyan());
    println!("  Files: {}", checkpoint.metadata.file_count.to_string().cyan());
    println!("  Size: {}", format_bytes(checkpoint.metadata.total_size).cyan());
    println!("  New blobs: {}", snapshot.stats.blobs_written.to_string().cyan());
    println!("  Time: {}", format_duration(round_ms(start.elapsed())).to_string().cyan());
    if checkpoint.metadata.files_changed > 0 {
        println!("  Changed: {} files", checkpoint.metadata.files_changed.to_string().yellow());
    }
    Ok(())
}

fn cmd_restore(ctx: &Workspace, target: &str, dry_run: bool, progress: bool) -> Result<()> {
    let engine = open_engine(ctx)?;
    let target = engine.resolve(&ctx.session, target)?;
    println!("{} {}", "Restoring to checkpoint".blue().bold(), target.short_id().yellow());

    let pb = spinner(progress, "Restoring files...");
    let options = RestoreOptions {
        dry_run,
        ..Default::default()
    };
    let cancel = CancelToken::new();
    let result = match &pb {
        Some(pb) => {
            let pb = pb.clone();
            let observer: ApplyObserver = Arc::new(move |path: &str| pb.set_message(format!("Restored {}", path)));
            engine.restore_with_progress(&ctx.session, &target.id, options, &cancel, observer)
        }
        None => engine.restore_with_report(&ctx.session, &target.id, options, &cancel),
    };
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let report = match result {
        Ok(report) => report,
        Err(RewindError::RestoreFailed { unapplied, reason, .. }) => {
            eprintln!("{} Restore stopped: {}", "✗".red().bold(), reason);
            eprintln!("{}", "Not applied:".red());
            for path in &unapplied {
                eprintln!("  - {}", path.display());
            }
            bail!("restore to {} was only partially applied", target.short_id());
        }
        Err(e) => return Err(e).context("restoring"),
    };

    if report.dry_run {
        println!("{}", "Dry run, nothing changed:".dimmed());
        println!("  Would add: {}", report.planned.files_added.to_string().green());
        println!("  Would modify: {}", report.planned.files_modified.to_string().yellow());
        println!("  Would remove: {}", report.planned.files_removed.to_string().red());
        return Ok(());
    }

    println!("{} Restore complete", "✓".green().bold());
    if let Some(pre) = &report.pre_restore {
        println!("  Previous state saved as {}", pre.short_id().yellow());
    }
    println!("  Files written: {}", report.files_written.to_string().cyan());
    println!("  Files removed: {}", report.files_removed.to_string().yellow());
    println!("  Modes restored: {}", report.modes_restored.to_string().cyan());
    println!("  Bytes written: {}", format_bytes(report.bytes_written).cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
    );
    if !report.skipped_special.is_empty() {
        println!("\n{}", "Skipped special files:".yellow().bold());
        for path in &report.skipped_special {
            println!("  - {}", path.yellow());
        }
    }
    Ok(())
}

fn cmd_list(ctx: &Workspace, detailed: bool, limit: Option<usize>) -> Result<()> {
    let engine = open_engine(ctx)?;
    let checkpoints = engine.list(&ctx.session)?;
    if checkpoints.is_empty() {
        println!("{}", "No checkpoints found.".yellow());
        return Ok(());
    }
    let current = engine.current(&ctx.session)?.map(|c| c.id);

    println!("{}", "Checkpoints:".blue().bold());
    println!();
    let shown = limit.unwrap_or(checkpoints.len()).min(checkpoints.len());
    for checkpoint in checkpoints.iter().take(shown) {
        let marker = if current.as_deref() == Some(checkpoint.id.as_str()) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        print!("{} {} ", marker, checkpoint.short_id().yellow().bold());
        print!("{} ", checkpoint.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed());
        if checkpoint.is_pre_restore() {
            print!("{} ", "[pre-restore]".magenta());
        }
        println!("{}", checkpoint.message.cyan());

        if detailed {
            println!(
                "    Files: {} | Size: {} | Changed: {}",
                checkpoint.metadata.file_count.to_string().dimmed(),
                format_bytes(checkpoint.metadata.total_size).dimmed(),
                checkpoint.metadata.files_changed.to_string().dimmed()
            );
            if let Some(parent) = &checkpoint.parent_id {
                println!("    Parent: {}", short(parent).dimmed());
            }
            println!();
        }
    }
    if shown < checkpoints.len() {
        println!("\n{}", format!("Showing {} of {} checkpoints", shown, checkpoints.len()).dimmed());
    }
    Ok(())
}

fn cmd_timeline(ctx: &Workspace) -> Result<()> {
    let engine = open_engine(ctx)?;
    let roots = engine.timeline(&ctx.session)?;
    if roots.is_empty() {
        println!("{}", "No checkpoints found.".yellow());
        return Ok(());
    }
    println!("{}", "Timeline:".blue().bold());
    for (i, root) in roots.iter().enumerate() {
        print!("{}", root.format_tree("", i == roots.len() - 1));
    }

    let stats = engine.timeline_stats(&ctx.session)?;
    println!(
        "\n{}",
        format!(
            "{} checkpoints, {} branch point(s), depth {}, {} pre-restore",
            stats.total_checkpoints, stats.total_branches, stats.max_depth, stats.pre_restore_checkpoints
        )
        .dimmed()
    );
    Ok(())
}

fn cmd_fork(ctx: &Workspace, from: &str, message: &str) -> Result<()> {
    let engine = open_engine(ctx)?;
    let from = engine.resolve(&ctx.session, from)?;
    println!("{}{}", "Forking from checkpoint ".blue().bold(), from.short_id().yellow());
    let fork = engine.fork(&ctx.session, &from.id, message).context("forking")?;
    println!("{} Created fork {}", "✓".green().bold(), fork.short_id().yellow().bold());
    println!("  Message: {}", fork.message.cyan());
    Ok(())
}

fn cmd_diff(
    ctx: &Workspace,
    from: &str,
    to: &str,
    lines: bool,
    stat_only: bool,
    options: &DiffOptions,
) -> Result<()> {
    let engine = open_engine(ctx)?;
    let from = engine.resolve(&ctx.session, from)?;
    let to = engine.resolve(&ctx.session, to)?;
    println!(
        "{} {} → {}",
        "Comparing".blue().bold(),
        from.short_id().yellow(),
        to.short_id().yellow()
    );
    println!();

    let deltas = engine.diff(&from.id, &to.id)?;
    show_diff_stats(&deltas);
    if stat_only {
        return Ok(());
    }
    if !lines {
        show_file_list(&deltas);
        return Ok(());
    }

    let (mut added, mut deleted) = (0, 0);
    for delta in deltas.iter() {
        match engine.line_detail(delta, options)? {
            LineDetail::Text(file) => {
                added += file.lines_added;
                deleted += file.lines_deleted;
                println!("\n{} {}", "diff".dimmed(), file.path.cyan());
                println!("{} a/{}", "---".dimmed(), file.path);
                println!("{} b/{}", "+++".dimmed(), file.path);
                for hunk in &file.hunks {
                    println!(
                        "{}",
                        format!(
                            "@@ -{},{} +{},{} @@",
                            hunk.from_line, hunk.from_count, hunk.to_line, hunk.to_count
                        )
                        .cyan()
                    );
                    for change in &hunk.changes {
                        match change {
                            LineChange::Added(_, line) => println!("{}", format!("+{}", line).green()),
                            LineChange::Deleted(_, line) => println!("{}", format!("-{}", line).red()),
                            LineChange::Context(_, line) => println!(" {}", line.dimmed()),
                        }
                    }
                }
            }
            LineDetail::Binary => {
                println!("\n{} {}", "diff".dimmed(), delta.path.cyan());
                println!("{}", "Binary files differ".yellow());
            }
            LineDetail::NotApplicable => match &delta.change {
                Change::Added(_) => println!("\n{}", format!("+ {} (new file)", delta.path).green()),
                Change::Removed(_) => println!("\n{}", format!("- {} (deleted)", delta.path).red()),
                Change::Modified { old, new } => println!(
                    "\n{}",
                    format!("~ {} (mode {:o} → {:o})", delta.path, old.mode, new.mode).yellow()
                ),
            },
        }
    }
    println!(
        "\n  {} insertion(s)(+), {} deletion(s)(-)",
        added.to_string().green(),
        deleted.to_string().red()
    );
    Ok(())
}

fn show_diff_stats(deltas: &DeltaSet) {
    let stats = deltas.stats();
    println!("{}", "Summary:".bold());
    println!(
        "  Added: {} files ({})",
        stats.files_added.to_string().green(),
        format_bytes(stats.bytes_added).green()
    );
    println!(
        "  Modified: {} files ({})",
        stats.files_modified.to_string().yellow(),
        format_bytes(stats.bytes_modified).yellow()
    );
    println!(
        "  Removed: {} files ({})",
        stats.files_removed.to_string().red(),
        format_bytes(stats.bytes_removed).red()
    );
}

fn show_file_list(deltas: &DeltaSet) {
    if deltas.is_empty() {
        return;
    }
    println!();
    for delta in deltas.iter() {
        match delta.change {
            Change::Added(_) => println!("  {} {}", "+".green(), delta.path.green()),
            Change::Removed(_) => println!("  {} {}", "-".red(), delta.path.red()),
            Change::Modified { .. } => println!("  {} {}", "~".yellow(), delta.path.yellow()),
        }
    }
}

fn check_mark(ok: bool, good: &str, bad: &str) -> ColoredString {
    if ok {
        format!("✓ {}", good).green()
    } else {
        format!("✗ {}", bad).red()
    }
}

fn cmd_verify(ctx: &Workspace, checkpoint: Option<String>, all: bool) -> Result<()> {
    let engine = open_engine(ctx)?;
    if all {
        println!("{}", "Verifying all checkpoints...".blue().bold());
        let report = engine.verify_session(&ctx.session)?;
        println!("\n{}", "Session Verification Report:".bold());
        println!("  Total checkpoints: {}", report.total_checkpoints);
        println!("  Valid checkpoints: {}", report.valid_checkpoints.to_string().green());
        println!("  Invalid checkpoints: {}", report.invalid_checkpoints.to_string().red());
        println!("  History structure: {}", check_mark(report.structure_valid, "Valid", "Invalid"));
        println!("  Current pointer: {}", check_mark(report.current_pointer_valid, "Valid", "Invalid"));
        println!("  Hash conflicts: {}", check_mark(report.no_hash_conflicts, "None", "Found"));
        for (id, errors) in &report.checkpoint_errors {
            println!("\n  {}", short(id).yellow());
            for error in errors {
                println!("    - {}", error.red());
            }
        }
        println!("  Verification time: {}ms", report.verification_time_ms);
        if !report.is_valid() {
            bail!("session '{}' failed verification", ctx.session);
        }
        return Ok(());
    }

    let checkpoint = match checkpoint {
        Some(prefix) => engine.resolve(&ctx.session, &prefix)?,
        None => engine
            .current(&ctx.session)?
            .context("no checkpoint given and the session has no current checkpoint")?,
    };
    println!("{} {}", "Verifying checkpoint".blue().bold(), checkpoint.short_id().yellow());

    let report = engine.verify_checkpoint(&checkpoint.id)?;
    println!("\n{}", "Verification Report:".bold());
    println!("  State hash: {}", check_mark(report.state_hash_valid, "Valid", "Invalid"));
    println!("  Tree: {}", check_mark(report.tree_valid, "Valid", "Invalid"));
    println!("  Parent: {}", check_mark(report.parent_valid, "Valid", "Invalid"));
    println!(
        "  Files: {}/{} valid",
        report.files_valid.to_string().green(),
        report.total_files_checked
    );
    for error in &report.errors {
        println!("  - {}", error.red());
    }
    if !report.is_valid() {
        bail!("checkpoint {} failed verification", checkpoint.short_id());
    }
    Ok(())
}

fn cmd_repair(ctx: &Workspace) -> Result<()> {
    let engine = open_engine(ctx)?;
    println!("{}", "Checking every stored object...".blue().bold());
    let report = engine.repair()?;
    println!("  Blobs checked: {}", report.blobs_checked);
    println!("  Trees checked: {}", report.trees_checked);
    println!("  Temp files removed: {}", report.tmp_files_removed);
    if report.quarantined.is_empty() {
        println!("{} No corrupted objects", "✓".green().bold());
    } else {
        println!("\n{}", "Quarantined:".yellow().bold());
        for object in &report.quarantined {
            println!("  - {}", object.yellow());
        }
    }
    if !report.damaged_checkpoints.is_empty() {
        println!("\n{}", "Checkpoints with missing content:".red().bold());
        for id in &report.damaged_checkpoints {
            println!("  - {}", short(id).red());
        }
    }
    Ok(())
}

fn cmd_gc(ctx: &Workspace, dry_run: bool) -> Result<()> {
    let engine = open_engine(ctx)?;
    let start = Instant::now();
    if dry_run {
        println!("{}", "Analyzing garbage collection (dry run)...".blue().bold());
        let stats = engine.gc_analyze()?;
        println!("\n{}", "Analysis Results:".bold());
        println!("  Blobs examined: {}", stats.blobs_examined);
        println!("  Unreferenced blobs: {}", stats.blobs_deleted.to_string().yellow());
        println!("  Unreferenced trees: {}", stats.trees_deleted.to_string().yellow());
        println!("  Orphan records: {}", stats.records_deleted.to_string().yellow());
        println!("  Space to reclaim: {}", format_bytes(stats.bytes_reclaimed).green());
        for hash in stats.unreferenced.iter().take(10) {
            println!("  - {}", hash[..hash.len().min(16)].dimmed());
        }
        if stats.unreferenced.len() > 10 {
            println!("  ... and {} more", (stats.unreferenced.len() - 10).to_string().dimmed());
        }
        println!("\n{}", "No changes made (dry run)".dimmed());
    } else {
        println!("{}", "Running garbage collection...".blue().bold());
        let stats = engine.gc()?;
        println!("\n{} Garbage collection complete", "✓".green().bold());
        println!("  Blobs deleted: {}", stats.blobs_deleted.to_string().green());
        println!("  Trees deleted: {}", stats.trees_deleted.to_string().green());
        println!("  Records deleted: {}", stats.records_deleted.to_string().green());
        println!("  Space reclaimed: {}", format_bytes(stats.bytes_reclaimed).green());
    }
    println!(
        "\n{}",
        format!("Total time: {}", format_duration(round_ms(start.elapsed()))).dimmed()
    );
    Ok(())
}

fn cmd_status(ctx: &Workspace) -> Result<()> {
    let engine = open_engine(ctx)?;
    println!("{}", "Rewind Status:".blue().bold());
    println!("  Session: {}", ctx.session.cyan());
    println!();

    match engine.current(&ctx.session)? {
        Some(current) => {
            println!("{}", "Current checkpoint:".bold());
            print_checkpoint(&current);
        }
        None => println!("{}", "No current checkpoint".yellow()),
    }

    let changes = engine.status(&ctx.session)?;
    println!("\n{}", "Working directory:".bold());
    if changes.is_empty() {
        println!("  {}", "clean".green());
    } else {
        show_file_list(&changes);
    }

    let usage = engine.store().disk_usage()?;
    println!("\n{}", "Storage:".bold());
    println!("  Location: {}", engine.storage_path().display());
    println!("  Blobs: {} ({})", usage.blob_count, format_bytes(usage.blob_bytes));
    println!("  Trees: {}", usage.tree_count);
    Ok(())
}

fn print_checkpoint(checkpoint: &Checkpoint) {
    println!("  ID: {}", checkpoint.id.yellow());
    println!("  Kind: {}", checkpoint.kind);
    println!("  Created: {}", checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Message: {}", checkpoint.message.cyan());
    println!("  Files: {}", checkpoint.metadata.file_count);
    println!("  Size: {}", format_bytes(checkpoint.metadata.total_size));
}

fn cmd_info(ctx: &Workspace, checkpoint: &str) -> Result<()> {
    let engine = open_engine(ctx)?;
    let checkpoint = engine.resolve(&ctx.session, checkpoint)?;
    println!("{}", "Checkpoint:".blue().bold());
    print_checkpoint(&checkpoint);
    println!("  Tree: {}", checkpoint.tree_hash.short().dimmed());
    println!("  Changed vs parent: {} files", checkpoint.metadata.files_changed);
    println!("  Host: {}", checkpoint.metadata.host_info.hostname.dimmed());
    if !checkpoint.metadata.tags.is_empty() {
        println!("  Tags: {}", checkpoint.metadata.tags.join(", "));
    }

    match &checkpoint.parent_id {
        Some(parent) => println!("  Parent: {}", short(parent).yellow()),
        None => println!("  Parent: {}", "none (root)".dimmed()),
    }
    let children: Vec<String> = engine
        .index()
        .timeline(&ctx.session)?
        .read()
        .children(&checkpoint.id)
        .iter()
        .map(|c| c.short_id().to_string())
        .collect();
    if !children.is_empty() {
        println!("  Children: {}", children.join(", ").yellow());
    }
    let depth = engine.ancestors(&checkpoint.id)?.len();
    println!("  Depth: {}", depth);
    Ok(())
}

fn cmd_sessions(ctx: &Workspace) -> Result<()> {
    let engine = Rewind::open(&ctx.storage)
        .with_context(|| format!("opening storage at {}", ctx.storage.display()))?;
    let sessions = engine.sessions()?;
    if sessions.is_empty() {
        println!("{}", "No sessions registered.".yellow());
        return Ok(());
    }
    println!("{}", "Sessions:".blue().bold());
    for session in sessions {
        let count = engine.list(&session.session_id).map(|c| c.len()).unwrap_or(0);
        let archived = if session.archived { " (archived)" } else { "" };
        println!(
            "  {} {} checkpoints  {}{}",
            session.session_id.yellow().bold(),
            count,
            session.root.display().to_string().dimmed(),
            archived.dimmed()
        );
    }
    Ok(())
}

fn round_ms(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
