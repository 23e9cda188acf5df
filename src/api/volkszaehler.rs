// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, EXPECT, USER_AGENT};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    api::{ApiClient, UploadError, parse_exception, session::HttpSessionProvider},
    pipeline::channel::Channel,
};

/// Per-channel upload of `[[t_ms, value], ...]` tuples to
/// `{middleware}/data/{uuid}.json`.
pub struct Volkszaehler {
    channel: Arc<Channel>,
    /// Session key: serialises requests per middleware instance.
    middleware: String,
    url: String,
    timeout: Duration,
    /// Millisecond timestamp of the newest acknowledged reading; older
    /// samples never leave again.
    last_timestamp: i64,
}

impl Volkszaehler {
    pub fn new(channel: Arc<Channel>) -> Result<Self> {
        let cfg = channel.config();
        let middleware = cfg
            .middleware
            .clone()
            .context("missing middleware url")?;
        let url = format!("{}/data/{}.json", middleware, channel.uuid());
        let timeout = Duration::from_secs(cfg.timeout);
        debug!(channel = %channel.name(), url = %url, "using default api");

        Ok(Self {
            channel,
            middleware,
            url,
            timeout,
            last_timestamp: 0,
        })
    }
}

#[async_trait]
impl ApiClient for Volkszaehler {
    async fn send(&mut self) -> Result<(), UploadError> {
        let buffer = self.channel.buffer();
        let tuples = buffer.snapshot(self.last_timestamp);
        if tuples.is_empty() {
            debug!(channel = %self.channel.name(), "nothing to send now");
            buffer.clean();
            return Ok(());
        }

        let body = json!(
            tuples
                .iter()
                .map(|r| json!([r.time_ms(), r.value()]))
                .collect::<Vec<_>>()
        );
        debug!(
            channel = %self.channel.name(),
            tuples = tuples.len(),
            body = %body,
            "request body"
        );

        let session = HttpSessionProvider::global()
            .get(&self.middleware)
            .await?;
        let response = session
            .client()
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, crate::api::USER_AGENT)
            // lighttpd middlewares stall on 100-continue
            .header(EXPECT, "")
            .timeout(self.timeout)
            .body(body.to_string())
            .send()
            .await;
        drop(session);

        match response {
            Ok(resp) if resp.status().is_success() => {
                self.last_timestamp = tuples
                    .iter()
                    .map(|r| r.time_ms())
                    .max()
                    .unwrap_or(self.last_timestamp);
                buffer.clean();
                debug!(
                    channel = %self.channel.name(),
                    code = resp.status().as_u16(),
                    "request succeeded"
                );
                Ok(())
            },
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                let mut drop_oldest = None;
                let message = match parse_exception(&text) {
                    Some((detail, duplicate)) => {
                        if duplicate {
                            // the middleware already stores the oldest tuple;
                            // drop it so the backlog cannot poison itself
                            warn!(
                                channel = %self.channel.name(),
                                "middleware says duplicated value, removing first entry"
                            );
                            drop_oldest = tuples.first().map(|r| r.time_ms());
                        }
                        format!("'{}': '{}'", detail.kind, detail.message)
                    },
                    None => text,
                };
                buffer.requeue_failed(drop_oldest);
                Err(UploadError::Remote { status, message })
            },
            Err(e) => {
                buffer.requeue_failed(None);
                Err(UploadError::Network(e))
            },
        }
    }

    async fn register_device(&mut self) -> Result<()> {
        // channels are created middleware-side; nothing to announce
        info!(
            channel = %self.channel.name(),
            middleware = %self.middleware,
            "channel uses middleware-managed registration"
        );
        Ok(())
    }
}
