//! Reconciliation daemon: keeps every active project's workspace
//! container and document tree converged.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atelier_core::config::{self, EngineConfig};
use atelier_core::db;
use atelier_core::engine::reconcile;
use atelier_core::engine::runtime::DockerCli;
use atelier_core::engine::watcher::{WatchKind, WatcherService};
use atelier_core::engine::workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = config::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(&data_dir, "atelierd.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    let cfg = EngineConfig::load().context("loading configuration")?;
    info!(config = %config::config_path().display(), "starting atelierd");

    let handle = db::init(&data_dir.join("atelier.db"))
        .await
        .context("opening database")?;

    let runtime = Arc::new(DockerCli::new(cfg.container_bin.clone(), cfg.exec_timeout()));
    let maintenance_interval = std::time::Duration::from_secs(cfg.maintenance_interval_secs);
    let ws = Arc::new(WorkspaceManager::new(handle.clone(), runtime, cfg));
    let watchers = Arc::new(WatcherService::new(ws.clone()));

    let projects = atelier_core::engine::store::list_active_projects(&handle)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    info!(count = projects.len(), "watching active projects");
    for (project, owner) in &projects {
        let name = atelier_core::engine::store::get_project(&handle, project)
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .map(|p| p.name)
            .unwrap_or_else(|| "<unnamed>".into());
        info!(%name, "project watcher starting");
        watchers.start_watching(project, WatchKind::Files, Some(owner.clone()));
        watchers.start_watching(project, WatchKind::Folders, Some(owner.clone()));
    }

    // event log tap
    let mut events = watchers.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "workspace change");
        }
    });

    // periodic reconciliation across every active project
    let maintenance = {
        let ws = ws.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(maintenance_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // skip the immediate first tick; watchers cover startup
            interval.tick().await;
            loop {
                interval.tick().await;
                let projects = match atelier_core::engine::store::list_active_projects(&handle).await {
                    Ok(p) => p,
                    Err(err) => {
                        error!(%err, "maintenance: listing active projects failed");
                        continue;
                    }
                };
                for (project, owner) in projects {
                    match reconcile::full_cleanup(&handle, &ws, &project).await {
                        Ok(report) if report.total() > 0 => {
                            info!(removed = report.total(), "maintenance cleanup")
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "maintenance cleanup failed"),
                    }
                    if let Err(err) =
                        reconcile::full_sync(&handle, &ws, &project, Some(&owner)).await
                    {
                        warn!(%err, "maintenance sync failed");
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    maintenance.abort();
    watchers.emergency_stop();
    Ok(())
}
