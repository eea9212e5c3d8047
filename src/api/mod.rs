//! Admin API server: read endpoints over the live daemon state plus an
//! ad-hoc scanner trigger.

pub mod routes;

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ApiConfig;
use crate::detect::BaselineManager;
use crate::scanner::Registry;
use crate::scheduler::Scheduler;
use crate::signatures::SignatureStore;
use crate::state::ResultCache;

pub struct AppState {
    pub cfg: RwLock<ApiConfig>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<ResultCache>,
    pub baselines: Arc<BaselineManager>,
    pub signatures: Arc<SignatureStore>,
}

impl AppState {
    pub fn update_config(&self, cfg: ApiConfig) {
        *self.cfg.write().unwrap_or_else(|e| e.into_inner()) = cfg;
    }
}

pub async fn serve(state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let bind = state
        .cfg
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .bind_addr
        .clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind admin api on {bind}"))?;
    info!(%bind, "admin api listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("admin api server")?;
    Ok(())
}
