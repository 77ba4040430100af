//! Walkthrough of the tiered context memory coordinator.
//!
//! Stores task contexts, shares classified context with a listening consumer,
//! records completed work, and runs maintenance, logging each step.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tiered_context::memory::{
    ContextConsumer, ContextDraft, MaintenanceOutcome, MemoryConfig, MemoryCoordinator,
    MemoryResult, SharedContextItem,
};
use tiered_context::primitives::{AgentId, TaskId};
use tiered_context::telemetry::{TelemetryConfig, init_tracing};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "memory-walkthrough",
    about = "Exercise the tiered context memory coordinator",
    version
)]
struct Cli {
    /// JSON memory configuration; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the short-term capacity
    #[arg(long)]
    short_term_capacity: Option<usize>,

    /// Keep the background scheduler running for this many seconds (0 skips it)
    #[arg(long, default_value_t = 0)]
    run_for: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

struct LoggingConsumer;

#[async_trait]
impl ContextConsumer for LoggingConsumer {
    fn name(&self) -> &str {
        "logger"
    }

    async fn on_context_shared(&self, key: &str, item: Arc<SharedContextItem>) -> MemoryResult<()> {
        info!(
            key,
            category = %item.category(),
            relevance = item.relevance(),
            "context received"
        );
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<MemoryConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            MemoryConfig::from_json_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => MemoryConfig::default(),
    };
    if let Some(capacity) = cli.short_term_capacity {
        config = config.with_short_term_capacity(capacity);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let directive = if cli.verbose { "debug" } else { "info" };
    init_tracing(&TelemetryConfig::default().with_default_directive(directive))?;

    let coordinator = MemoryCoordinator::builder(load_config(&cli)?).build()?;
    coordinator.register_consumer(Arc::new(LoggingConsumer)).await;

    short_term_walkthrough(&coordinator).await?;
    working_walkthrough(&coordinator).await?;
    long_term_walkthrough(&coordinator).await?;

    match coordinator.run_maintenance_cycle().await {
        MaintenanceOutcome::Completed(report) => info!(?report, "manual maintenance cycle"),
        MaintenanceOutcome::Skipped => warn!("maintenance already running"),
    }

    if cli.run_for > 0 {
        let handle = coordinator.start_maintenance();
        info!(seconds = cli.run_for, "scheduler running; ctrl-c stops early");
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(cli.run_for)) => {}
            result = tokio::signal::ctrl_c() => result.context("listening for ctrl-c")?,
        }
        handle.stop().await;
    }

    let analytics = coordinator.analytics_snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&analytics)?);
    Ok(())
}

async fn short_term_walkthrough(coordinator: &MemoryCoordinator) -> Result<()> {
    let tasks = [
        ("extract-invoice", "Extract totals from the March invoice", &["ocr", "invoice"][..]),
        ("extract-receipt", "Read the fuel receipt", &["ocr", "receipt"][..]),
        ("plan-week", "Plan next week's review schedule", &["calendar"][..]),
    ];
    for (id, description, tags) in tasks {
        let context = coordinator
            .new_task_context(TaskId::new(id)?, description)
            .requirements(tags.iter().copied())?
            .build();
        coordinator.store_context(context).await;
    }

    let related = coordinator.related_tasks(&["ocr", "invoice"], 0.3, 5).await;
    for task in &related {
        info!(task_id = %task.context.task_id(), similarity = task.similarity, "related task");
    }
    Ok(())
}

async fn working_walkthrough(coordinator: &MemoryCoordinator) -> Result<()> {
    let drafts = [
        ContextDraft::new("Invoice total is 1,240 EUR including VAT").with_origin_turn(1),
        ContextDraft::new("The scanned receipt PDF has two pages")
            .with_origin_turn(2)
            .with_scope("doc-42"),
        ContextDraft::new("User prefers amounts in EUR with the default date format")
            .with_origin_turn(3),
    ];
    for draft in drafts {
        let outcome = coordinator.share_context(draft).await;
        for placement in &outcome.stored {
            info!(key = %placement.key, relevance = placement.relevance, "context stored");
        }
        if let Some(propagation) = outcome.propagation {
            match propagation.await {
                Ok(report) => info!(delivered = report.delivered, failed = report.failed, "propagated"),
                Err(err) => warn!(?err, "propagation task failed"),
            }
        }
    }

    let planner = AgentId::new("planner")?;
    coordinator
        .set_scratch(&planner, "current_step", serde_json::json!("collect totals"))
        .await;

    for item in coordinator.shared_context_for(&["financial", "preference"]).await {
        info!(key = %item.key, score = item.score, content = item.item.content(), "ranked context");
    }
    Ok(())
}

async fn long_term_walkthrough(coordinator: &MemoryCoordinator) -> Result<()> {
    let agent = AgentId::new("extractor")?;
    if let Some(context) = coordinator.peek_context(&TaskId::new("extract-invoice")?).await {
        coordinator
            .record_task_completion(&context, Some(agent.clone()), Some(0.92))
            .await?;
    }
    if let Some(context) = coordinator.peek_context(&TaskId::new("extract-receipt")?).await {
        coordinator
            .record_task_completion(&context, Some(agent.clone()), Some(0.78))
            .await?;
    }
    coordinator
        .record_workflow_completion("month-close", Some(agent.clone()), Some(0.85))
        .await?;

    let report = coordinator
        .query_performance(&agent, Duration::from_secs(60 * 60))
        .await?;
    info!(
        agent = %report.agent_id,
        executions = report.summary.executions,
        average_quality = ?report.summary.average_quality,
        "performance over the last hour"
    );
    for pattern in coordinator.task_patterns(2).await? {
        info!(tag = %pattern.tag, support = pattern.support, "recurring requirement");
    }
    Ok(())
}
