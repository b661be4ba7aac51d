use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use zenwatch::application::scheduler::Scheduler;
use zenwatch::application::usecases::{Dispatcher, RunOnceUseCase, WatchService};
use zenwatch::application::{NotificationSink, SeenSet, SourceAdapter, WatchStore};
use zenwatch::domain::Platform;
use zenwatch::infrastructure::{
    broadcast_publisher::BroadcastPublisher, coalescing_source::CoalescingSource,
    console_notifier::ConsoleNotifier, event_bus::EventBus, multi_notifier::MultiNotifier,
    platform_source::PlatformSource, sqlite_store::SqliteStore,
    telegram_notifier::TelegramNotifier, zenmarket_source::ZenMarketSource,
};
use zenwatch::interfaces::config::Config;
use zenwatch::interfaces::http_api::{build_router, ApiState};

#[derive(Parser, Debug)]
#[command(name = "zenwatch")]
struct Args {
    /// Path to config.yaml
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Evaluate every active watch once and exit
    #[arg(long)]
    once: bool,

    /// Do not send external notifications (console only)
    #[arg(long)]
    dry_run: bool,

    /// Do not start the HTTP API even if configured
    #[arg(long)]
    no_http: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("zenwatch=info".parse()?))
        .init();
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env"));
    }
    let args = Args::parse();

    // 1) load config
    let cfg = Config::load_from_file(&args.config)
        .with_context(|| format!("failed to load config {}", args.config))?;

    // 2) build infra
    let store = Arc::new(
        SqliteStore::new(&cfg.database_url, cfg.limits.max_watches_per_user)
            .await
            .context("opening sqlite store")?,
    );
    let watches: Arc<dyn WatchStore> = store.clone();
    let seen: Arc<dyn SeenSet> = store;

    let client = ZenMarketSource::default_client()?;
    let mut platforms = PlatformSource::new();
    for platform in Platform::ALL {
        let mut source = ZenMarketSource::new(client.clone(), platform);
        if let Some(ua) = &cfg.user_agent {
            source = source.with_user_agent(ua.clone());
        }
        platforms = platforms.with(platform, Box::new(source));
    }
    let source: Arc<dyn SourceAdapter> = Arc::new(CoalescingSource::new(
        platforms,
        Duration::from_secs(cfg.fetch_cache_seconds),
    ));

    // notifiers fanout
    let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(ConsoleNotifier::new())];
    if args.dry_run {
        tracing::warn!("--dry-run enabled: only console output");
    } else if let Some(tg) = &cfg.telegram {
        let mut telegram = TelegramNotifier::new(tg.bot_token.clone());
        if let Some(base) = &tg.api_base {
            telegram = telegram.with_api_base(base.clone());
        }
        sinks.push(Box::new(telegram));
    } else {
        tracing::warn!("telegram not configured, notifications go to console only");
    }
    let sink: Arc<dyn NotificationSink> = Arc::new(MultiNotifier::new(sinks));

    let bus = EventBus::new(256);
    let dispatcher = Arc::new(
        Dispatcher::new(source, seen.clone(), sink.clone(), cfg.dispatch_config())
            .with_publisher(Arc::new(BroadcastPublisher::new(bus.clone()))),
    );

    // 3) run once
    if args.once {
        let run_once = RunOnceUseCase {
            store: watches.as_ref(),
            seen: seen.as_ref(),
            dispatcher: dispatcher.as_ref(),
        };
        let summary = run_once.execute().await.context("run once failed")?;
        tracing::info!(
            evaluated = summary.evaluated,
            failed = summary.failed,
            notified = summary.notified,
            retired = summary.retired,
            "run once completed"
        );
        return Ok(());
    }

    // 4) scheduler + command surface
    let (scheduler, handle) = Scheduler::new(
        watches.clone(),
        seen.clone(),
        dispatcher,
        cfg.scheduler_config(),
    );
    let scheduler = scheduler.with_alert_sink(sink);
    let service = WatchService::new(watches, seen).with_scheduler(handle.clone());

    if let Some(http) = cfg.http.as_ref().filter(|_| !args.no_http) {
        let state = ApiState {
            service,
            api_token: http.api_token.clone(),
            event_bus: Some(bus),
        };
        let listener = tokio::net::TcpListener::bind(&http.bind)
            .await
            .with_context(|| format!("binding {}", http.bind))?;
        tracing::info!(bind = %http.bind, "http api listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, build_router(state)).await {
                tracing::error!("http api stopped: {e}");
            }
        });
    }

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            shutdown.shutdown();
        }
    });

    scheduler.run().await?;
    Ok(())
}
