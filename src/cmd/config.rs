//! `phaser config`, `phaser audits`, and `phaser events` — store surface.

use super::CmdContext;
use crate::events::EventBus;
use crate::store::EventFilter;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use console::style;

pub fn config_show(ctx: &CmdContext, json: bool) -> Result<()> {
    let config = ctx.store.get_config()?;
    if json {
        super::print_json(&config)
    } else {
        print!("{}", config.to_yaml()?);
        Ok(())
    }
}

pub fn config_set(ctx: &CmdContext, key: &str, value: &str) -> Result<()> {
    ctx.store.set_config(key, value)?;
    println!("{} {} = {}", style("ok:").green(), key, value);
    Ok(())
}

pub fn config_reset(ctx: &CmdContext) -> Result<()> {
    ctx.store.reset_config()?;
    println!("{} configuration reset to defaults", style("ok:").green());
    Ok(())
}

pub fn audits_list(ctx: &CmdContext, project: Option<&str>, json: bool) -> Result<()> {
    let audits = ctx.store.list_audits(project)?;
    if json {
        return super::print_json(&audits);
    }
    if audits.is_empty() {
        println!("No audits recorded");
        return Ok(());
    }
    for audit in &audits {
        println!(
            "{} {} {} — {}/{} phases",
            audit.started_at,
            style(&audit.slug).cyan(),
            audit.status,
            audit.phases_completed(),
            audit.phases.len()
        );
    }
    Ok(())
}

pub fn audits_show(ctx: &CmdContext, slug: &str, json: bool) -> Result<()> {
    let audit = ctx
        .store
        .find_audit_by_slug(slug)?
        .with_context(|| format!("No audit with slug '{}'", slug))?;
    if json {
        return super::print_json(&audit);
    }
    println!("{} ({})", audit.title, audit.status);
    for phase in &audit.phases {
        println!("  {} Phase {}: {}", phase.status.marker(), phase.number, phase.title);
    }
    Ok(())
}

pub fn audits_abandon(ctx: &CmdContext, slug: &str, yes: bool) -> Result<()> {
    let audit = ctx
        .store
        .find_audit_by_slug(slug)?
        .with_context(|| format!("No audit with slug '{}'", slug))?;
    if !yes {
        bail!("Refusing to abandon '{}' without --yes", slug);
    }
    ctx.store.abandon_audit(audit.id)?;
    let bus = EventBus::with_store(ctx.store.clone());
    bus.emit(
        crate::events::EventType::AuditAbandoned,
        audit.id,
        None,
        serde_json::Map::new(),
    );
    println!("{} audit '{}' abandoned", style("ok:").green(), slug);
    Ok(())
}

pub fn events_list(ctx: &CmdContext, slug: Option<&str>, json: bool) -> Result<()> {
    let audit_id = match slug {
        Some(slug) => Some(
            ctx.store
                .find_audit_by_slug(slug)?
                .with_context(|| format!("No audit with slug '{}'", slug))?
                .id,
        ),
        None => None,
    };
    let events = ctx.store.get_events(&EventFilter {
        audit_id,
        ..Default::default()
    })?;
    if json {
        return super::print_json(&events);
    }
    for event in &events {
        let phase = event
            .phase
            .map(|p| format!(" phase {}", p))
            .unwrap_or_default();
        println!("{} {}{}", event.timestamp, event.event_type, phase);
    }
    Ok(())
}

pub fn events_clear(ctx: &CmdContext, before: Option<&str>) -> Result<()> {
    let bound = match before {
        Some(raw) => Some(
            raw.parse::<DateTime<Utc>>()
                .or_else(|_| format!("{}T00:00:00Z", raw).parse::<DateTime<Utc>>())
                .with_context(|| format!("Invalid --before value '{}'", raw))?,
        ),
        None => None,
    };
    let removed = ctx.store.clear_events(bound)?;
    println!("Removed {} event(s)", removed);
    Ok(())
}
