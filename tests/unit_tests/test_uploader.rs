// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use axum::{Router, extract::State, http::StatusCode, routing::post};
use meterd_rs::{
    api::{ApiClient, volkszaehler::Volkszaehler},
    cfg::config::{ChannelConfig, LocalConfig},
    meter::ProtocolKind,
    model::reading::{Reading, ReadingIdentifier},
    pipeline::channel::Channel,
};

#[derive(Clone, Default)]
struct Middleware {
    bodies: Arc<Mutex<Vec<String>>>,
    fail_first: Arc<AtomicBool>,
}

async fn data_endpoint(State(state): State<Middleware>, body: String) -> (StatusCode, String) {
    state
        .bodies
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(body);
    if state.fail_first.swap(false, Ordering::SeqCst) {
        (
            StatusCode::BAD_REQUEST,
            r#"{"exception":{"type":"PDOException","message":"SQLSTATE[23000]: Duplicate entry 1000"}}"#
                .to_string(),
        )
    } else {
        (StatusCode::OK, "[]".to_string())
    }
}

async fn start_middleware(fail_first: bool) -> Result<(Middleware, String)> {
    let state = Middleware {
        bodies: Arc::new(Mutex::new(Vec::new())),
        fail_first: Arc::new(AtomicBool::new(fail_first)),
    };
    let router = Router::new()
        .route("/data/{file}", post(data_endpoint))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Ok((state, format!("http://{addr}")))
}

fn channel_for(middleware: &str) -> Result<Arc<Channel>> {
    let cfg = ChannelConfig {
        uuid: "d1c6db0f-be6d-4e82-b3b9-0bba4f3c7d06".to_string(),
        middleware: Some(middleware.to_string()),
        ..ChannelConfig::default()
    };
    Channel::from_config(cfg, ProtocolKind::D0, "chn0".to_string(), &LocalConfig::default())
}

fn rd(value: f64, secs: f64) -> Reading {
    Reading::new(
        value,
        Reading::time_from_epoch_secs(secs),
        ReadingIdentifier::Nil,
    )
}

/// Duplicate recovery: the middleware rejects the first POST as a
/// duplicate of its oldest tuple; the retry must only carry the rest.
#[tokio::test]
async fn duplicate_entry_drops_oldest_and_retries() -> Result<()> {
    let (middleware, url) = start_middleware(true).await?;
    let ch = channel_for(&url)?;
    let mut api = Volkszaehler::new(Arc::clone(&ch))?;

    ch.push(rd(1.0, 1.0));
    ch.push(rd(2.0, 2.0));

    let first = api.send().await;
    assert!(first.is_err(), "400 must surface as an upload error");

    api.send().await?;

    let bodies = middleware
        .bodies
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0], "[[1000,1.0],[2000,2.0]]");
    assert_eq!(bodies[1], "[[2000,2.0]]");

    // nothing older than the acknowledged snapshot stays behind
    assert!(ch.buffer().is_empty());
    Ok(())
}

/// After a successful upload the buffer holds nothing at or before the
/// snapshot's maximum timestamp, and stale samples never leave again.
#[tokio::test]
async fn acknowledged_timestamps_never_resend() -> Result<()> {
    let (middleware, url) = start_middleware(false).await?;
    let ch = channel_for(&url)?;
    let mut api = Volkszaehler::new(Arc::clone(&ch))?;

    ch.push(rd(1.0, 1.0));
    ch.push(rd(2.0, 2.0));
    api.send().await?;
    assert!(ch.buffer().is_empty());

    // a reading older than the acknowledged one is filtered out
    ch.push(rd(9.0, 1.5));
    api.send().await?;
    assert!(ch.buffer().is_empty());

    let bodies = middleware
        .bodies
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    assert_eq!(bodies.len(), 1, "stale sample must not reach the wire");
    assert_eq!(bodies[0], "[[1000,1.0],[2000,2.0]]");
    Ok(())
}

/// A connection failure keeps the backlog for the next round.
#[tokio::test]
async fn network_error_retains_the_buffer() -> Result<()> {
    // nothing listens on this port
    let ch = channel_for("http://127.0.0.1:9")?;
    let mut api = Volkszaehler::new(Arc::clone(&ch))?;

    ch.push(rd(5.0, 10.0));
    assert!(api.send().await.is_err());

    let contents = ch.buffer().contents();
    assert_eq!(contents.len(), 1);
    assert!(!contents[0].deleted(), "entries must be re-armed for retry");
    Ok(())
}
