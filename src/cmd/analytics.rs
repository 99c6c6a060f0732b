//! `phaser analytics` — execution-report queries.

use super::{CmdContext, OutputFormat};
use crate::analytics::{Analytics, AnalyticsQuery, ExecutionStatus, aggregate};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use console::style;
use std::path::Path;

pub struct QueryArgs {
    pub last: Option<usize>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub document: Option<String>,
}

fn parse_bound(value: Option<&str>, name: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    // Accept a date or a full timestamp.
    if let Ok(ts) = value.parse::<DateTime<Utc>>() {
        return Ok(Some(ts));
    }
    let with_time = format!("{}T00:00:00Z", value);
    with_time
        .parse::<DateTime<Utc>>()
        .map(Some)
        .with_context(|| format!("Invalid --{} value '{}'", name, value))
}

fn build_query(args: &QueryArgs) -> Result<AnalyticsQuery> {
    Ok(AnalyticsQuery {
        limit: args.last,
        since: parse_bound(args.since.as_deref(), "since")?,
        until: parse_bound(args.until.as_deref(), "until")?,
        status: args.status,
        document: args.document.clone(),
    })
}

pub fn show(ctx: &CmdContext, args: &QueryArgs, format: OutputFormat) -> Result<()> {
    let analytics = Analytics::new(ctx.store.clone());
    let records = analytics.list(&build_query(args)?)?;
    let stats = aggregate(&records);

    if format == OutputFormat::Json {
        return super::print_json(&serde_json::json!({
            "executions": records,
            "aggregate": stats,
        }));
    }

    if records.is_empty() {
        println!("No executions recorded");
        return Ok(());
    }
    for record in &records {
        let badge = match record.status {
            ExecutionStatus::Success => style("success").green().to_string(),
            ExecutionStatus::Partial => style("partial").yellow().to_string(),
            ExecutionStatus::Failed => style("failed").red().to_string(),
        };
        println!(
            "{} {} {} — {}/{} phases, tests {:+}",
            record.started_at,
            badge,
            record.document_title,
            record.phases_completed,
            record.phases_planned,
            record.test_delta()
        );
    }
    println!(
        "\n{} run(s): {:.0}% success, phase success {:.0}%, total test delta {:+}",
        stats.total,
        stats.success_rate * 100.0,
        stats.phase_success_rate * 100.0,
        stats.total_test_delta
    );
    Ok(())
}

pub fn import(ctx: &CmdContext, report: &Path) -> Result<()> {
    let analytics = Analytics::new(ctx.store.clone());
    let record = analytics.import(report)?;
    println!(
        "{} imported execution {} ({})",
        style("ok:").green(),
        record.execution_id,
        record.document_title
    );
    Ok(())
}

pub fn export(ctx: &CmdContext, args: &QueryArgs, output: Option<&Path>) -> Result<()> {
    let analytics = Analytics::new(ctx.store.clone());
    let records = analytics.list(&build_query(args)?)?;
    let json = serde_json::to_string_pretty(&records)?;
    match output {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported {} record(s) to {}", records.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub fn clear(ctx: &CmdContext, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to clear analytics without --yes");
    }
    let analytics = Analytics::new(ctx.store.clone());
    let removed = analytics.clear()?;
    println!("Removed {} execution record(s)", removed);
    Ok(())
}
