use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collaboration::{
    CollabConfig, CollabEvent, ConflictResolver, EventBus, OperationProcessor, ProjectExport,
    VersionControl, VersionId, MAIN_BRANCH,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use timeline::TimelineState;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "collab-cli")]
#[command(about = "Inspect exported collaborative projects")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize an exported project
    Stats {
        /// Export file path
        export: PathBuf,
    },

    /// List the versions on a branch, oldest first
    History {
        /// Export file path
        export: PathBuf,

        /// Branch name
        #[arg(short, long, default_value = MAIN_BRANCH)]
        branch: String,
    },

    /// Show the clip-level changes between two versions
    Diff {
        /// Export file path
        export: PathBuf,

        /// Base version id
        from: String,

        /// Target version id
        to: String,
    },

    /// Replay the operation history and compare it with the stored timeline
    Replay {
        /// Export file path
        export: PathBuf,
    },

    /// Print the effective session configuration
    Config {
        /// JSON config file; defaults are printed when omitted
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Stats { export } => stats_command(export).await,
        Commands::History { export, branch } => history_command(export, branch).await,
        Commands::Diff { export, from, to } => diff_command(export, from, to).await,
        Commands::Replay { export } => replay_command(export).await,
        Commands::Config { file } => config_command(file).await,
    }
}

async fn load_export(path: &Path) -> Result<ProjectExport> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let export = ProjectExport::from_json(&json)
        .with_context(|| format!("Failed to parse export {}", path.display()))?;
    info!("Loaded project {} exported at {}", export.project.id, export.exported_at);
    Ok(export)
}

async fn stats_command(path: PathBuf) -> Result<()> {
    let export = load_export(&path).await?;
    let project = &export.project;
    let versions = VersionControl::from_history(export.version_history.clone())?;
    let applied = export.operation_history.iter().filter(|e| e.applied).count();

    let stats = serde_json::json!({
        "project_id": project.id,
        "tracks": project.timeline.tracks.len(),
        "clips": project.timeline.clip_count(),
        "assets": project.assets.len(),
        "operations": export.operation_history.len(),
        "applied_operations": applied,
        "pending_operations": export.operation_history.len() - applied,
        "comments": project.comments.len(),
        "unresolved_comments": project.comments.iter().filter(|c| !c.resolved).count(),
        "versions": versions.len(),
        "branches": versions.branches(),
        "current_branch": versions.current_branch(),
        "exported_at": export.exported_at.to_rfc3339(),
    });

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn history_command(path: PathBuf, branch: String) -> Result<()> {
    let export = load_export(&path).await?;
    let versions = VersionControl::from_history(export.version_history)?;

    let history = versions.history(&branch);
    if history.is_empty() {
        warn!("No versions on branch {}", branch);
        return Ok(());
    }

    for version in history {
        let summary = &version.changes_summary;
        println!(
            "{}  {}  {} by {}  (+{} ~{} -{})",
            version.id,
            version.created_at.format("%Y-%m-%d %H:%M:%S"),
            version.name,
            version.created_by,
            summary.added.len(),
            summary.modified.len(),
            summary.deleted.len(),
        );
    }
    Ok(())
}

async fn diff_command(path: PathBuf, from: String, to: String) -> Result<()> {
    let export = load_export(&path).await?;
    let versions = VersionControl::from_history(export.version_history)?;

    let diff = versions.diff(&VersionId(from), &VersionId(to))?;
    println!("{}", serde_json::to_string_pretty(&diff)?);
    Ok(())
}

async fn replay_command(path: PathBuf) -> Result<()> {
    let export = load_export(&path).await?;
    let config = CollabConfig::default();
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();

    let processor = OperationProcessor::new(
        TimelineState::default(),
        config.detector,
        Arc::new(ConflictResolver::new()),
        events.clone(),
    );
    for entry in &export.operation_history {
        processor.enqueue(entry.operation.clone());
    }
    let report = processor.drain();
    info!(
        "Replayed {} operations: {} applied, {} deferred, {} failed, {} conflicts",
        export.operation_history.len(),
        report.applied,
        report.deferred,
        report.failed,
        report.conflicts
    );

    while let Ok(event) = rx.try_recv() {
        if let CollabEvent::OperationFailed { operation_id, error } = event {
            warn!("Operation {} failed: {}", operation_id, error);
        }
    }

    if *processor.timeline() == export.project.timeline {
        println!("Replay matches the stored timeline");
    } else {
        // playhead, zoom and viewport are not carried by operations
        println!("Replay differs from the stored timeline");
    }
    Ok(())
}

async fn config_command(file: Option<PathBuf>) -> Result<()> {
    let config = match file {
        Some(path) => {
            let json = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            CollabConfig::from_json(&json)?
        }
        None => CollabConfig::default(),
    };

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
