//! The `fetch` command: run URLs through the access controller.

use std::sync::Arc;

use chrono::Utc;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{info, warn};

use crate::access::{
    build_plan, domain_override, AccessController, ClassifierRules, CliOverrides,
    ControllerSettings, FetchSpec, PlanLayer, StrategyCache,
};
use crate::config::Settings;
use crate::escalation::{EscalationRouter, JsonFileStore};
use crate::playbook::Playbooks;
use crate::recon::ReconCache;
use crate::record::{AccessRecord, JsonlFile};
use crate::report::RunSummary;
use crate::transport::{HttpTransport, Transports};
use crate::utils::domain_key;

use super::helpers::{styled_outcome, truncate};
use super::FetchArgs;

/// Everything the workers share for one run.
struct RunContext {
    controller: AccessController,
    router: Option<EscalationRouter>,
    playbooks: Playbooks,
    recon: ReconCache,
    cache: Mutex<StrategyCache>,
    records: JsonlFile,
    defaults: PlanLayer,
    fetch_spec: PlanLayer,
    cli_overrides: PlanLayer,
}

pub async fn cmd_fetch(settings: &Settings, args: FetchArgs) -> anyhow::Result<()> {
    settings.ensure_directories()?;

    let rules = ClassifierRules::load_or_default(&settings.rules_file)?;
    info!(
        "Classifier rules {} ({})",
        rules.version,
        &rules.fingerprint()[..12]
    );
    let rules = Arc::new(rules);

    let playbook_path = args.playbooks.as_ref().unwrap_or(&settings.playbook_file);
    let playbooks = Playbooks::load(playbook_path)?;
    let recon = ReconCache::load(&settings.recon_cache_file);
    let cache = StrategyCache::load(&settings.strategy_cache_file)
        .with_max_age_days(settings.strategy_cache_max_age_days);

    let fetch_spec = match &args.run_spec {
        Some(path) => {
            let contents = tokio::fs::read_to_string(path).await?;
            let spec: FetchSpec = serde_yaml::from_str(&contents)?;
            spec.to_layer()
        }
        None => PlanLayer::default(),
    };
    let cli_overrides = CliOverrides {
        access_max_attempts: args.access_max_attempts,
        access_escalation_mode: args.access_escalation_mode,
        initial_strategy: args.strategy,
    }
    .to_layer();

    let transports = Arc::new(build_transports(settings)?);

    let attempt_log = Arc::new(JsonlFile::open(&settings.attempt_log_file).await?);
    let records = JsonlFile::open(&settings.records_file).await?;

    let (router, router_handle) = if args.no_queue {
        (None, None)
    } else {
        let store = Arc::new(JsonFileStore::new(&settings.queue_file));
        let (router, handle) = EscalationRouter::spawn(store, settings.queue);
        (Some(router), Some(handle))
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} Interrupted, finishing in-flight attempts...",
                style("!").yellow()
            );
            let _ = shutdown_tx.send(true);
        }
    });

    let mut controller = AccessController::new(
        transports.clone(),
        attempt_log,
        rules.clone(),
        ControllerSettings {
            attempt_timeout: std::time::Duration::from_secs(settings.request_timeout),
            tier: args.tier,
            ..ControllerSettings::default()
        },
    )
    .with_shutdown(shutdown_rx);
    if let Some(router) = &router {
        controller = controller.with_router(router.clone());
    }

    let ctx = Arc::new(RunContext {
        controller,
        router,
        playbooks,
        recon,
        cache: Mutex::new(cache),
        records,
        defaults: settings.plan_defaults.clone(),
        fetch_spec,
        cli_overrides,
    });

    let jobs = args.jobs.unwrap_or(settings.jobs).max(1);
    let total = args.urls.len();
    println!(
        "{} Fetching {} URLs with {} workers",
        style("→").cyan(),
        total,
        jobs
    );

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let semaphore = Arc::new(Semaphore::new(jobs));
    let mut handles = Vec::with_capacity(total);
    for url in args.urls {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        let pb = pb.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            pb.set_message(truncate(&url, 50));
            let record = process_url(&ctx, &url).await;
            pb.inc(1);
            record
        }));
    }

    let mut records = Vec::with_capacity(total);
    let mut first_error = None;
    for handle in handles {
        match handle.await? {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("URL skipped: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }
    pb.finish_and_clear();

    if let Err(e) = ctx.cache.lock().await.save() {
        warn!("Failed to save strategy cache: {}", e);
    }
    transports.shutdown().await;

    let summary = RunSummary::from_records(&records, &rules);
    summary.write(&settings.summary_file)?;
    print_summary(&records, &summary);

    drop(ctx);
    if let Some(handle) = router_handle {
        let _ = handle.await;
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn process_url(ctx: &RunContext, url: &str) -> anyhow::Result<AccessRecord> {
    let domain = domain_key(url);
    let playbook = ctx.playbooks.get(&domain);
    let now = Utc::now();

    let mut hints = ctx.recon.hints_for(&domain).cloned().unwrap_or_default();
    hints.cached_strategy = ctx.cache.lock().await.cached_strategy(&domain, now);

    let mut plan = build_plan(
        &domain,
        &ctx.defaults,
        &ctx.fetch_spec,
        &ctx.cli_overrides,
        Some(&hints),
        playbook,
    )?;
    if let Some(router) = &ctx.router {
        match router.is_perpetual_manual(&domain).await {
            Ok(true) => plan.mark_perpetual_manual(),
            Ok(false) => {}
            Err(e) => warn!(domain = %domain, "Perpetual-manual check failed: {}", e),
        }
    }

    let override_ = domain_override(playbook);
    let record = ctx
        .controller
        .run(url, &plan, override_.as_ref(), Some(&hints))
        .await;

    if !record.attempts.is_empty() {
        let markers: Vec<String> = record
            .attempts
            .iter()
            .flat_map(|a| a.outcome.detected_markers.iter().cloned())
            .collect();
        ctx.cache.lock().await.record(
            &domain,
            record.final_strategy,
            record.success,
            &markers,
            Utc::now(),
        );
    }
    if let Err(e) = ctx.records.append_json(&record).await {
        warn!(url, "Failed to write access record: {}", e);
    }
    Ok(record)
}

fn build_transports(settings: &Settings) -> anyhow::Result<Transports> {
    let http = HttpTransport::new(settings.user_agent.as_deref(), settings.proxy.as_deref())?;
    #[allow(unused_mut)]
    let mut transports = Transports::new(http);

    #[cfg(feature = "browser")]
    {
        use crate::transport::{BrowserSettings, BrowserTransport};
        transports = transports.with_browser(BrowserTransport::new(BrowserSettings {
            remote_url: settings.browser_url.clone(),
            proxy: settings.proxy.clone(),
            chrome_args: Vec::new(),
        }));
    }

    Ok(transports)
}

fn print_summary(records: &[AccessRecord], summary: &RunSummary) {
    for record in records {
        let outcome = record
            .final_outcome
            .as_ref()
            .map(|o| styled_outcome(o.outcome))
            .unwrap_or_else(|| style("skipped").dim().to_string());
        let strategy = record
            .final_strategy
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let marker = if record.success {
            style("✓").green()
        } else {
            style("✗").red()
        };
        let queued = if record.queued {
            style(" (queued)").yellow().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} {:<50} {:<16} {}{}",
            marker,
            truncate(&record.url, 50),
            strategy,
            outcome,
            queued
        );
    }

    println!();
    println!("{}", style("Run Summary").bold());
    println!("{}", "-".repeat(40));
    println!("{:<20} {}", "URLs:", summary.urls);
    println!(
        "{:<20} {} ({:.1}%)",
        "Succeeded:",
        summary.succeeded,
        summary.success_rate * 100.0
    );
    println!("{:<20} {}", "Queued:", summary.queued);
    println!("{:<20} {}", "Attempts:", summary.total_attempts);
    for (kind, count) in &summary.outcome_distribution {
        println!("  {:<18} {}", kind, count);
    }
    println!(
        "{:<20} {} ({})",
        "Rules:",
        summary.rules_version,
        &summary.rules_fingerprint[..12]
    );
}
