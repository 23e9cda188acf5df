// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::{cfg::enums::ApiKind, pipeline::channel::Channel};

pub mod influxdb;
pub mod mysmartgrid;
pub mod null;
pub mod push;
pub mod session;
pub mod volkszaehler;

/// Sent with every outbound request so middleware operators can tell the
/// daemon's traffic apart.
pub const USER_AGENT: &str = concat!("meterd/", env!("CARGO_PKG_VERSION"));

/// Upload failures are transient by default: the buffer keeps the readings
/// and the uploader retries after the configured pause.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("network: {0}")]
    Network(#[from] reqwest::Error),
    #[error("middleware returned {status}: {message}")]
    Remote { status: u16, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error body shape some middlewares answer with.
#[derive(Deserialize, Debug)]
pub struct ExceptionBody {
    pub exception: ExceptionDetail,
}

#[derive(Deserialize, Debug)]
pub struct ExceptionDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Parses a middleware error body, reporting whether it describes a
/// duplicate-entry conflict (the reading is already stored remotely).
pub fn parse_exception(body: &str) -> Option<(ExceptionDetail, bool)> {
    let parsed: ExceptionBody = serde_json::from_str(body).ok()?;
    let duplicate = parsed.exception.kind == "PDOException"
        && parsed.exception.message.contains("Duplicate entry");
    Some((parsed.exception, duplicate))
}

/// One middleware binding per channel: drains the channel buffer towards
/// the remote store with at-least-once semantics.
#[async_trait]
pub trait ApiClient: Send {
    /// Performs one upload round over the pending readings.
    async fn send(&mut self) -> Result<(), UploadError>;

    /// One-time channel/device announcement towards the middleware.
    async fn register_device(&mut self) -> Result<()>;
}

/// Builds the API binding the channel is configured for.
pub fn create(channel: Arc<Channel>) -> Result<Box<dyn ApiClient>> {
    let api = channel.config().api;
    Ok(match api {
        ApiKind::Volkszaehler => Box::new(volkszaehler::Volkszaehler::new(channel)?),
        ApiKind::MySmartGrid => Box::new(mysmartgrid::MySmartGrid::new(channel)?),
        ApiKind::InfluxDb => Box::new(influxdb::InfluxDb::new(channel)?),
        ApiKind::Null => Box::new(null::Null::new(channel)),
    })
}
