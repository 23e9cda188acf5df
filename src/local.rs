// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cfg::config::LocalConfig,
    pipeline::{channel::Channel, supervisor::MeterView},
};

/// Live per-channel state exposed to the read-only HTTP surface. Only
/// last-known-good readings appear here; errors never do.
pub struct LocalSource {
    entries: Vec<LocalEntry>,
}

struct LocalEntry {
    meter: String,
    protocol: &'static str,
    channel: Arc<Channel>,
}

impl LocalSource {
    pub fn new(views: &[MeterView]) -> Self {
        let entries = views
            .iter()
            .flat_map(|v| {
                v.channels.iter().map(|ch| LocalEntry {
                    meter: v.meter_name.clone(),
                    protocol: v.protocol,
                    channel: Arc::clone(ch),
                })
            })
            .collect();
        Self { entries }
    }

    fn channel_json(&self, entry: &LocalEntry, limit: usize) -> Value {
        let ch = &entry.channel;
        let tuples: Vec<Value> = ch
            .buffer()
            .tail(limit)
            .iter()
            .map(|r| json!([r.time_ms(), r.value()]))
            .collect();

        json!({
            "uuid": ch.uuid(),
            "meter": entry.meter,
            "protocol": entry.protocol,
            "last": ch.last().map(|r| json!([r.time_ms(), r.value()])),
            "tuples": tuples,
        })
    }

    /// Snapshot document: all channels, or the one matching `uuid`.
    pub fn snapshot(&self, uuid: Option<&str>, limit: usize) -> Option<Value> {
        let data: Vec<Value> = self
            .entries
            .iter()
            .filter(|e| uuid.is_none_or(|u| e.channel.uuid() == u))
            .map(|e| self.channel_json(e, limit))
            .collect();
        if uuid.is_some() && data.is_empty() {
            return None;
        }

        Some(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "generator": "meterd",
            "data": data,
        }))
    }

    fn find(&self, uuid: &str) -> Option<&LocalEntry> {
        self.entries.iter().find(|e| e.channel.uuid() == uuid)
    }
}

struct AppState {
    source: LocalSource,
    cfg: LocalConfig,
}

/// Serves the local surface until shutdown. `GET /` lists every channel
/// (when the index is enabled), `GET /{uuid}[.json]` one channel,
/// long-polling for fresh data when a timeout is configured.
pub async fn serve(
    source: LocalSource,
    cfg: LocalConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", cfg.port);
    info!(port = cfg.port, "starting local interface");

    let state = Arc::new(AppState { source, cfg });
    let router = Router::new()
        .route("/", get(index))
        .route("/{uuid}", get(by_uuid))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("local interface failed")
}

async fn index(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if !state.cfg.index {
        return not_found("channel index is disabled");
    }
    match state.source.snapshot(None, state.cfg.buffer) {
        Some(doc) => (StatusCode::OK, Json(doc)),
        None => not_found("no channels"),
    }
}

async fn by_uuid(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> (StatusCode, Json<Value>) {
    let uuid = uuid.strip_suffix(".json").unwrap_or(&uuid).to_string();

    // hold the response until fresh data arrived, bounded by the timeout
    if state.cfg.timeout > 0
        && let Some(entry) = state.source.find(&uuid)
    {
        let _ = timeout(
            Duration::from_secs(state.cfg.timeout),
            entry.channel.observe(),
        )
        .await;
    }

    match state.source.snapshot(Some(&uuid), state.cfg.buffer) {
        Some(doc) => (StatusCode::OK, Json(doc)),
        None => not_found("channel not found"),
    }
}

fn not_found(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "generator": "meterd",
            "exception": { "message": message },
        })),
    )
}
