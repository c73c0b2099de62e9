//! wftrack CLI: read-only views over a workflow tracker database.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use workflow_tracker::telemetry::{TelemetryConfig, init_telemetry};
use workflow_tracker::{Status, TrackerConfig, WorkflowFilter, WorkflowId, WorkflowTracker};

#[derive(Parser)]
#[command(name = "wftrack", about = "Inspect tracked workflows")]
struct Cli {
    /// TOML tracker config. Without it, TRACKER_DB_* environment variables are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Redraw every N seconds until interrupted
    #[arg(long, global = true)]
    watch: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Workflow counts and average steps per workflow
    Stats,
    /// List workflows
    List {
        /// pending, completed or failed
        #[arg(long)]
        status: Option<String>,
        /// Substring of the workflow name
        #[arg(long)]
        name: Option<String>,
        /// Identifier as key=value
        #[arg(long)]
        identifier: Option<String>,
        /// Only workflows that have this step
        #[arg(long)]
        step: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 10)]
        page_size: i64,
        /// started_at or ended_at
        #[arg(long, default_value = "started_at")]
        order_by: String,
        /// asc or desc
        #[arg(long, default_value = "desc")]
        order: String,
    },
    /// Most frequent step names
    TopSteps {
        #[arg(long, default_value_t = 5)]
        limit: i64,
    },
    /// Show one workflow and its steps
    Show {
        /// Workflow ID (full UUID)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::from_env()?,
    };
    let guard = init_telemetry(TelemetryConfig::from_env().backend(config.backend))?;
    tracing::debug!(exporting = guard.is_exporting(), "telemetry ready");

    let tracker = WorkflowTracker::connect(config).await?;

    let result = match cli.watch {
        Some(secs) => watch(&tracker, &cli.command, Duration::from_secs(secs.max(1))).await,
        None => render(&tracker, &cli.command).await,
    };

    tracker.destroy().await;
    result
}

async fn watch(tracker: &WorkflowTracker, command: &Command, every: Duration) -> anyhow::Result<()> {
    loop {
        // Clear screen, cursor home.
        print!("\x1B[2J\x1B[H");
        render(tracker, command).await?;
        println!("\n(refreshing every {}s, ctrl-c to stop)", every.as_secs());

        tokio::select! {
            () = tokio::time::sleep(every) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn render(tracker: &WorkflowTracker, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Stats => cmd_stats(tracker).await,
        Command::List {
            status,
            name,
            identifier,
            step,
            page,
            page_size,
            order_by,
            order,
        } => {
            let mut filter = WorkflowFilter::new()
                .page(*page, *page_size)
                .order_by(order_by, order);
            if let Some(s) = status {
                let status: Status = s
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?;
                filter = filter.status(status);
            }
            if let Some(n) = name {
                filter = filter.name(n);
            }
            if let Some(pair) = identifier {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("identifier must be key=value, got {pair}"))?;
                filter = filter.identifier(key, value);
            }
            if let Some(s) = step {
                filter = filter.step(s);
            }
            cmd_list(tracker, &filter).await
        }
        Command::TopSteps { limit } => cmd_top_steps(tracker, *limit).await,
        Command::Show { id } => cmd_show(tracker, id).await,
    }
}

async fn cmd_stats(tracker: &WorkflowTracker) -> anyhow::Result<()> {
    let stats = tracker.get_workflow_stats().await;

    println!("{:<12}  {:>8}", "METRIC", "VALUE");
    println!("{}", "-".repeat(22));
    println!("{:<12}  {:>8}", "total", stats.total);
    println!("{:<12}  {:>8}", "completed", stats.completed);
    println!("{:<12}  {:>8}", "pending", stats.pending);
    println!("{:<12}  {:>8}", "failed", stats.failed);
    println!("{:<12}  {:>8.2}", "avg steps", stats.avg_steps);
    Ok(())
}

async fn cmd_list(tracker: &WorkflowTracker, filter: &WorkflowFilter) -> anyhow::Result<()> {
    let page = tracker.get_workflows(filter).await;

    if page.workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<24}  {:<10}  {:<16}  {:<16}  IDENTIFIERS",
        "ID", "NAME", "STATUS", "STARTED", "ENDED"
    );
    println!("{}", "-".repeat(100));

    for workflow in &page.workflows {
        let identifiers = workflow
            .identifiers
            .iter()
            .map(|i| format!("{}={}", i.key, i.value))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<8}  {:<24}  {:<10}  {:<16}  {:<16}  {}",
            workflow.id.short(),
            truncate(&workflow.name, 24),
            workflow.status,
            workflow.started_at.format("%Y-%m-%d %H:%M"),
            workflow
                .ended_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            identifiers
        );
    }

    println!(
        "\npage {}/{} ({} workflow(s))",
        page.page, page.total_pages, page.total
    );
    Ok(())
}

async fn cmd_top_steps(tracker: &WorkflowTracker, limit: i64) -> anyhow::Result<()> {
    let steps = tracker.get_most_frequent_steps(limit).await;

    if steps.is_empty() {
        println!("No steps recorded.");
        return Ok(());
    }

    println!("{:<32}  {:>8}", "STEP", "COUNT");
    println!("{}", "-".repeat(42));
    for s in &steps {
        println!("{:<32}  {:>8}", truncate(&s.step, 32), s.count);
    }
    Ok(())
}

async fn cmd_show(tracker: &WorkflowTracker, id: &str) -> anyhow::Result<()> {
    let id: WorkflowId = id.parse()?;
    let Some(workflow) = tracker.get_workflow(id).await else {
        anyhow::bail!("no workflow with id {id}");
    };

    println!("ID:          {}", workflow.id);
    println!("Name:        {}", workflow.name);
    println!("Status:      {}", workflow.status);
    println!("Started:     {}", workflow.started_at);
    if let Some(ended) = workflow.ended_at {
        println!("Ended:       {ended}");
    }
    for ident in &workflow.identifiers {
        println!("Identifier:  {}={}", ident.key, ident.value);
    }

    let steps = tracker.get_steps(id).await;
    println!("---");
    if steps.is_empty() {
        println!("No steps recorded.");
    }
    for step in &steps {
        println!(
            "{}  {:<24}  {}",
            step.created_at.format("%H:%M:%S%.3f"),
            truncate(&step.step, 24),
            step.data
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}
