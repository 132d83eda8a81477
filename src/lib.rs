//! Cardea -- edge-to-brain event correlation and adaptive scoring for
//! network security sensors.
//!
//! The edge normalizes sensor records, queues them durably and forwards them.
//! The brain deduplicates and rate limits them, groups them into incidents,
//! scores each incident once and feeds sensitivity recommendations back to
//! the edge.

pub mod api;
pub mod brain;
pub mod config;
pub mod correlate;
pub mod edge;
pub mod event;
pub mod feedback;
pub mod ingress;
pub mod normalize;
pub mod scoring;
pub mod stats;
pub mod storage;
pub mod threshold;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::api::state::{BrainState, EdgeState};
use crate::brain::Brain;
use crate::config::CardeaConfig;
use crate::edge::{Edge, EdgeQueue, Forwarder, HttpUplink, SensitivityRegistry, Uplink};
use crate::normalize::Normalizer;

/// Run the brain daemon until Ctrl-C: API server plus background loops.
pub async fn serve_brain(cfg: CardeaConfig) -> Result<()> {
    let bind = cfg.server.brain_bind.clone();
    tracing::info!(db = %cfg.storage.brain_db_path.display(), "initializing brain");
    let brain = Brain::from_config(cfg)?;
    brain.start().await;

    let app = api::brain_router(BrainState {
        brain: Arc::clone(&brain),
    });
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid brain bind address '{}'", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "cardea brain listening");

    let cancel = brain.cancel_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    brain.shutdown().await;
    Ok(())
}

/// Run the edge daemon until Ctrl-C: sensor intake API, forwarder and
/// feedback poller.
pub async fn serve_edge(cfg: CardeaConfig) -> Result<()> {
    let queue = Arc::new(
        EdgeQueue::open(&cfg.storage.edge_db_path, cfg.edge.queue_capacity).with_context(|| {
            format!(
                "failed to open edge queue {}",
                cfg.storage.edge_db_path.display()
            )
        })?,
    );
    let sensitivity = Arc::new(SensitivityRegistry::from_config(&cfg.edge));
    let uplink: Arc<dyn Uplink> = Arc::new(HttpUplink::from_config(&cfg.edge)?);
    let edge = Arc::new(Edge::new(
        Normalizer::with_builtin_adapters(),
        Arc::clone(&queue),
        Arc::clone(&sensitivity),
    ));

    let cancel = CancellationToken::new();
    let forwarder = Forwarder::new(&cfg.edge, Arc::clone(&queue), Arc::clone(&uplink), Arc::clone(&sensitivity));
    let forwarder_task = tokio::spawn(forwarder.run(cancel.clone()));
    let poll_task = tokio::spawn(edge::forwarder::poll_feedback(
        uplink,
        sensitivity,
        Duration::from_secs(cfg.edge.feedback_poll_sec),
        cancel.clone(),
    ));

    let app = api::edge_router(EdgeState { edge });
    let bind = cfg.server.edge_bind.clone();
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid edge bind address '{}'", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, brain = %cfg.edge.brain_url, edge_id = %cfg.edge.edge_id, "cardea edge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    let _ = forwarder_task.await;
    let _ = poll_task.await;
    tracing::info!("edge stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}
