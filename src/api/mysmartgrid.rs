// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde_json::json;
use sha1::Sha1;
use tracing::{debug, info};

use crate::{
    api::{ApiClient, UploadError, session::HttpSessionProvider},
    cfg::enums::MsgChannelType,
    pipeline::channel::Channel,
};

type HmacSha1 = Hmac<Sha1>;

/// MySmartGrid sensor/device endpoint with the HMAC-SHA1 request digest.
///
/// Measurements post as `{"measurements": [[t_s, value], ...]}` no more
/// often than the configured interval.
pub struct MySmartGrid {
    channel: Arc<Channel>,
    middleware: String,
    url: String,
    secret: String,
    min_interval: i64,
    timeout: Duration,
    /// Epoch seconds of the first buffered sample awaiting its window.
    first_ts: i64,
    last_timestamp: i64,
}

impl MySmartGrid {
    pub fn new(channel: Arc<Channel>) -> Result<Self> {
        let cfg = channel.config();
        let middleware = cfg
            .middleware
            .clone()
            .context("missing middleware url")?;
        let secret = cfg.secret_key.clone().context("missing secretKey")?;
        let endpoint = match cfg.channel_type.unwrap_or_default() {
            MsgChannelType::Device => "device",
            MsgChannelType::Sensor => "sensor",
        };
        let url = format!("{}/{}/{}", middleware, endpoint, channel.uuid());
        debug!(channel = %channel.name(), url = %url, "using mysmartgrid api");

        Ok(Self {
            middleware,
            url,
            secret,
            min_interval: cfg.interval.unwrap_or(0),
            timeout: Duration::from_secs(cfg.timeout),
            first_ts: 0,
            last_timestamp: 0,
            channel,
        })
    }

    fn digest(&self, body: &str) -> String {
        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl ApiClient for MySmartGrid {
    async fn send(&mut self) -> Result<(), UploadError> {
        let now = Utc::now().timestamp();
        if self.first_ts > 0 {
            if now - self.first_ts < self.min_interval {
                // postpone until the posting window opened
                return Ok(());
            }
        } else {
            self.first_ts = now;
        }

        let buffer = self.channel.buffer();
        let tuples = buffer.snapshot(self.last_timestamp);
        if tuples.is_empty() {
            buffer.clean();
            return Ok(());
        }

        let body = json!({
            "measurements": tuples
                .iter()
                .map(|r| json!([r.time_parts().0, r.value()]))
                .collect::<Vec<_>>()
        })
        .to_string();
        let digest = self.digest(&body);
        debug!(channel = %self.channel.name(), digest = %digest, "request body signed");

        let session = HttpSessionProvider::global()
            .get(&self.middleware)
            .await?;
        let response = session
            .client()
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, crate::api::USER_AGENT)
            .header("X-Digest", &digest)
            .header("X-Version", "1.0")
            .timeout(self.timeout)
            .body(body)
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
                self.first_ts = now;
                buffer.clean();
                Ok(())
            },
            Ok(resp) => {
                let status = resp.status().as_u16();
                let message = resp.text().await.unwrap_or_default();
                buffer.requeue_failed(None);
                Err(UploadError::Remote { status, message })
            },
            Err(e) => {
                buffer.requeue_failed(None);
                Err(UploadError::Network(e))
            },
        }
    }

    async fn register_device(&mut self) -> Result<()> {
        let body = json!({ "uuid": self.channel.uuid() }).to_string();
        let digest = self.digest(&body);

        let session = HttpSessionProvider::global()
            .get(&self.middleware)
            .await
            .context("session for registration")?;
        let resp = session
            .client()
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, crate::api::USER_AGENT)
            .header("X-Digest", &digest)
            .header("X-Version", "1.0")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .context("registration request failed")?;
        info!(
            channel = %self.channel.name(),
            code = resp.status().as_u16(),
            "device registered"
        );
        Ok(())
    }
}
