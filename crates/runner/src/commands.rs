use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing::{info, warn};

use yieldsync_core::{
    metrics, prepare_profile, run_bridge, ArtifactStore, BrowserLauncher, BrowserLiveTable,
    Config, DiagnosticLog, IngestScheduler, Interceptor, RealtimeSync, SqliteStore, SystemClock,
    UrlCache, WebDriverLauncher,
};

use crate::shutdown_signal;

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::new(&config.database.path)
        .with_context(|| format!("Failed to open database {:?}", config.database.path))?;
    Ok(Arc::new(store))
}

fn live_table(config: &Config, launcher: Arc<dyn BrowserLauncher>) -> Arc<BrowserLiveTable> {
    Arc::new(BrowserLiveTable::new(
        launcher,
        config.realtime.clone(),
        config.browser.element_timeout(),
    ))
}

async fn export_metrics(config: &Config) {
    if let Some(path) = &config.metrics.textfile_path {
        match metrics::write_textfile(path).await {
            Ok(()) => info!(path = %path.display(), "Metrics written"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write metrics"),
        }
    }
}

/// One ingestion run.
pub async fn sync(config: Config) -> Result<()> {
    let store = open_store(&config)?;

    prepare_profile(&config.browser)
        .await
        .context("Failed to prepare browser profile")?;
    let launcher: Arc<dyn BrowserLauncher> = Arc::new(
        WebDriverLauncher::new(config.browser.clone()).context("Failed to create launcher")?,
    );
    if config.browser.spawn_driver {
        info!(launcher = launcher.name(), driver = %config.browser.driver_path, "Browser launcher ready, one driver per session");
    } else {
        info!(launcher = launcher.name(), webdriver = %config.browser.webdriver_url, "Browser launcher ready");
    }

    let url_cache = Arc::new(UrlCache::load(config.staging.url_cache_path.clone()).await);
    let diagnostics = Arc::new(DiagnosticLog::new(config.staging.diagnostics_dir.clone()));

    let mut scheduler = IngestScheduler::new(
        config.clone(),
        store,
        Arc::clone(&launcher),
        Arc::new(SystemClock),
        url_cache,
        diagnostics,
    );
    if config.tracked.discover_from_live_table {
        scheduler = scheduler.with_live_table(live_table(&config, launcher));
    }

    let report = tokio::select! {
        result = scheduler.run() => result.context("Ingestion run failed")?,
        _ = shutdown_signal() => {
            warn!("Ingestion run interrupted");
            export_metrics(&config).await;
            return Ok(());
        }
    };

    export_metrics(&config).await;
    match serde_json::to_string(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!(error = %e, "Failed to encode run report"),
    }
    Ok(())
}

/// Live snapshots, once or until shutdown.
pub async fn realtime(config: Config, once: bool) -> Result<()> {
    let store = open_store(&config)?;
    let launcher: Arc<dyn BrowserLauncher> = Arc::new(
        WebDriverLauncher::new(config.browser.clone()).context("Failed to create launcher")?,
    );

    let sync = RealtimeSync::new(
        live_table(&config, launcher),
        store,
        Arc::new(SystemClock),
        config.realtime.clone(),
        config.tracked.periods.clone(),
    );

    if once {
        let report = sync.run_once().await.context("Realtime snapshot failed")?;
        info!(
            captured_at = %report.captured_at,
            timeframe = report.timeframe,
            inserted = report.inserted,
            closed = report.closed,
            "Snapshot done"
        );
    } else {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(());
        });
        sync.run_periodic(shutdown_rx).await;
    }

    export_metrics(&config).await;
    Ok(())
}

/// Serve the proxy host's hook events until its stdin closes.
pub async fn intercept(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let artifacts = ArtifactStore::new(
        config.staging.artifact_dir.clone(),
        config.staging.artifact_ext.clone(),
    );
    let diagnostics = Arc::new(DiagnosticLog::new(config.staging.diagnostics_dir.clone()));

    let interceptor = Interceptor::new(
        config.source.clone(),
        store,
        artifacts,
        diagnostics,
        Arc::new(SystemClock),
    )
    .context("Failed to create interceptor")?;
    info!(api_prefix = %config.source.api_prefix, "Interceptor bridge ready");

    let stats = tokio::select! {
        result = run_bridge(&interceptor, BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            result.context("Hook bridge I/O failed")?
        }
        _ = shutdown_signal() => {
            info!("Interceptor bridge stopped");
            return Ok(());
        }
    };

    info!(events = stats.events, errors = stats.errors, "Hook input closed");
    Ok(())
}
