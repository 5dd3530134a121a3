//! `panebus run`: open one code viewer per root and stream notifications.

use anyhow::Context;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;

use panebus_core::types::{PaneKind, PaneMetadata};
use panebus_core::{DeliveryBatch, FocusSnapshot, PaneId, WorktreeId};
use panebus_runtime::{CoreConfig, PaneSpec, WorkspaceCore};

use crate::cli::RunOpts;

fn viewer_pane(worktree_id: &WorktreeId) -> PaneId {
    PaneId::new(format!("viewer-{worktree_id}"))
}

pub async fn cmd_run(config: CoreConfig, opts: RunOpts) -> anyhow::Result<()> {
    let core = WorkspaceCore::start(config).context("failed to start workspace core")?;
    let mut batches = core.subscribe_notifications();

    for (worktree_id, path) in &opts.roots {
        let root = core
            .add_worktree(worktree_id.clone(), path)
            .await
            .with_context(|| format!("failed to add worktree {worktree_id}"))?;
        let metadata = PaneMetadata {
            title: Some(worktree_id.to_string()),
            cwd: Some(root),
            worktree_id: Some(worktree_id.clone()),
            group: None,
        };
        core.open_pane(
            PaneSpec::new(viewer_pane(worktree_id), PaneKind::CodeViewer).with_metadata(metadata),
        )
        .await
        .with_context(|| format!("failed to open viewer for {worktree_id}"))?;
    }
    if let Some(focus) = &opts.focus {
        core.set_focus(FocusSnapshot::focused(viewer_pane(&WorktreeId::new(focus.as_str()))))
            .await;
    }
    tracing::info!(roots = opts.roots.len(), "watching");

    tokio::select! {
        result = shutdown_signal() => result?,
        () = print_batches(&mut batches) => tracing::warn!("notification stream closed"),
    }

    core.shutdown().await;
    // Final batch from the notifier flush.
    while let Ok(batch) = batches.try_recv() {
        print_batch(&batch)?;
    }
    Ok(())
}

async fn print_batches(batches: &mut broadcast::Receiver<Arc<DeliveryBatch>>) {
    loop {
        match batches.recv().await {
            Ok(batch) => {
                if let Err(e) = print_batch(&batch) {
                    tracing::warn!(error = %e, "failed to print batch");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "output lagged, batches dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn print_batch(batch: &DeliveryBatch) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    for notification in &batch.notifications {
        let line = serde_json::json!({
            "tier": notification.tier,
            "envelope": notification.envelope.as_ref(),
            "printed_at": chrono::Utc::now().to_rfc3339(),
        });
        writeln!(out, "{line}")?;
    }
    for gap in &batch.gaps {
        let line = serde_json::json!({
            "gap": {
                "source": &gap.source,
                "epoch": gap.epoch,
                "last_seq": gap.last_seq,
            },
            "printed_at": chrono::Utc::now().to_rfc3339(),
        });
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
    Ok(())
}
