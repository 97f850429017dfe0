//! Offline inspection commands: `classify` and `cache show`.

use std::path::Path;

use chrono::Utc;
use console::style;

use crate::access::{classify, AttemptReport, ClassifierRules, StrategyCache};
use crate::config::Settings;
use crate::recon::ReconCache;
use crate::transport::FetchResponse;
use crate::utils::domain_key;

use super::helpers::styled_outcome;

/// Classify a saved body as if it had just been fetched.
pub async fn cmd_classify(
    settings: &Settings,
    file: &Path,
    status: Option<u16>,
    content_type: &str,
    url: Option<&str>,
) -> anyhow::Result<()> {
    let rules = ClassifierRules::load_or_default(&settings.rules_file)?;
    let body = tokio::fs::read(file).await?;

    let mut response = FetchResponse {
        status,
        body,
        final_url: url.map(str::to_string),
        ..FetchResponse::default()
    };
    response
        .headers
        .insert("content-type".to_string(), content_type.to_string());

    let recon = ReconCache::load(&settings.recon_cache_file);
    let hints = url.and_then(|u| recon.hints_for(&domain_key(u)));

    let outcome = classify(&AttemptReport::Fetched(response), None, hints, &rules);

    println!(
        "{} {} ({})",
        style("→").cyan(),
        styled_outcome(outcome.outcome),
        outcome.reason
    );
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// Print cached strategies, optionally for one domain.
pub fn cmd_cache_show(settings: &Settings, domain: Option<&str>) -> anyhow::Result<()> {
    let cache = StrategyCache::load(&settings.strategy_cache_file)
        .with_max_age_days(settings.strategy_cache_max_age_days);
    let wanted = domain.map(domain_key);
    let now = Utc::now();

    let mut shown = 0;
    for (key, entry) in cache.iter() {
        if wanted.as_ref().is_some_and(|w| w != key) {
            continue;
        }
        let fresh = cache.entry(key, now).is_some();
        let success = entry
            .last_success_strategy
            .map(|s| style(s.to_string()).green().to_string())
            .unwrap_or_else(|| "-".to_string());
        let fail = entry
            .last_fail_strategy
            .map(|s| style(s.to_string()).red().to_string())
            .unwrap_or_else(|| "-".to_string());
        let age = if fresh {
            entry.updated_at.format("%Y-%m-%d %H:%M").to_string()
        } else {
            style(format!("{} (stale)", entry.updated_at.format("%Y-%m-%d")))
                .dim()
                .to_string()
        };
        println!("{:<40} ok={:<18} fail={:<18} {}", key, success, fail, age);
        if !entry.last_seen_block.is_empty() {
            println!("    markers: {}", entry.last_seen_block.join(", "));
        }
        shown += 1;
    }

    if shown == 0 {
        println!("{} No cached strategies", style("!").yellow());
    }
    Ok(())
}
