//! Manual-review queue commands.

use std::sync::Arc;

use console::style;

use crate::config::Settings;
use crate::escalation::{EscalationRouter, JsonFileStore, QueueEntry};

fn open_router(settings: &Settings) -> EscalationRouter {
    let store = Arc::new(JsonFileStore::new(&settings.queue_file));
    EscalationRouter::spawn(store, settings.queue).0
}

fn print_entry(entry: &QueueEntry) {
    let flag = if entry.perpetual_manual {
        style(" [perpetual manual]").red().to_string()
    } else {
        String::new()
    };
    println!(
        "{} {} ({:?}){}",
        style("•").cyan(),
        style(&entry.domain).bold(),
        entry.priority,
        flag
    );
    println!("{:<20} {}", "  Reason:", entry.reason);
    println!(
        "{:<20} {}",
        "  Added:",
        entry.added.format("%Y-%m-%d %H:%M")
    );
    if entry.requeue_count > 0 {
        println!("{:<20} {}", "  Requeued:", entry.requeue_count);
    }
    let strategies: Vec<String> = entry
        .attempted_strategies
        .iter()
        .map(|s| s.to_string())
        .collect();
    if !strategies.is_empty() {
        println!("{:<20} {}", "  Tried:", strategies.join(" → "));
    }
    let d = &entry.diagnostics;
    println!("{:<20} {}", "  URL:", d.url);
    if let Some(status) = d.http_status {
        println!("{:<20} {}", "  HTTP status:", status);
    }
    if let Some(ref waf) = d.waf_hint {
        println!("{:<20} {}", "  WAF:", waf);
    }
    if !d.detected_markers.is_empty() {
        println!("{:<20} {}", "  Markers:", d.detected_markers.join(", "));
    }
}

pub async fn cmd_queue_list(settings: &Settings) -> anyhow::Result<()> {
    let entries = open_router(settings).list().await?;
    if entries.is_empty() {
        println!("{} Queue is empty", style("✓").green());
        return Ok(());
    }
    println!("{} {} queued domains\n", style("→").cyan(), entries.len());
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

pub async fn cmd_queue_next(settings: &Settings) -> anyhow::Result<()> {
    match open_router(settings).next().await? {
        Some(entry) => print_entry(&entry),
        None => println!("{} Queue is empty", style("✓").green()),
    }
    Ok(())
}

pub async fn cmd_queue_complete(
    settings: &Settings,
    domain: &str,
    pages: u64,
    words: u64,
) -> anyhow::Result<()> {
    if open_router(settings).complete(domain, pages, words).await? {
        println!("{} Completed {}", style("✓").green(), domain);
    } else {
        println!(
            "{} {} was not queued; recorded completion anyway",
            style("!").yellow(),
            domain
        );
    }
    Ok(())
}

pub async fn cmd_queue_clear(settings: &Settings) -> anyhow::Result<()> {
    let removed = open_router(settings).clear().await?;
    println!("{} Removed {} entries", style("✓").green(), removed);
    Ok(())
}

pub async fn cmd_queue_perpetual(settings: &Settings, domain: &str) -> anyhow::Result<()> {
    if open_router(settings).is_perpetual_manual(domain).await? {
        println!("{} {} is perpetual manual", style("!").yellow(), domain);
    } else {
        println!("{} {} is not flagged", style("✓").green(), domain);
    }
    Ok(())
}
