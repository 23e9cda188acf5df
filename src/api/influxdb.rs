// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt::Write as _, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use tracing::{debug, info};

use crate::{
    api::{ApiClient, UploadError, session::HttpSessionProvider},
    model::reading::Reading,
    pipeline::channel::Channel,
};

const DEFAULT_MEASUREMENT: &str = "meterd";
/// Lines per request, matching typical server-side request caps.
const DEFAULT_MAX_BATCH: usize = 4500;

/// Line-protocol writer against `{host}/write?db={database}`.
pub struct InfluxDb {
    channel: Arc<Channel>,
    host: String,
    url: String,
    username: Option<String>,
    password: Option<String>,
    measurement: String,
    max_batch: usize,
    timeout: Duration,
    last_timestamp: i64,
}

impl InfluxDb {
    pub fn new(channel: Arc<Channel>) -> Result<Self> {
        let cfg = channel.config();
        let host = cfg.host.clone().context("missing host")?;
        let database = cfg.database.clone().context("missing database")?;
        let url = format!("{host}/write?db={database}");
        let measurement = cfg
            .measurement_name
            .clone()
            .unwrap_or_else(|| DEFAULT_MEASUREMENT.to_string());
        debug!(channel = %channel.name(), url = %url, "using influxdb api");

        Ok(Self {
            host,
            url,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            measurement,
            max_batch: cfg.max_batch_inserts.unwrap_or(DEFAULT_MAX_BATCH),
            timeout: Duration::from_secs(cfg.timeout),
            last_timestamp: 0,
            channel,
        })
    }

    fn batch_body(&self, tuples: &[Reading]) -> String {
        let mut body = String::new();
        for r in tuples {
            // nanosecond timestamps in line protocol
            let _ = writeln!(
                body,
                "{},uuid={} value={} {}",
                self.measurement,
                self.channel.uuid(),
                r.value(),
                r.time_ms() * 1_000_000
            );
        }
        body
    }
}

#[async_trait]
impl ApiClient for InfluxDb {
    async fn send(&mut self) -> Result<(), UploadError> {
        let buffer = self.channel.buffer();
        let tuples = buffer.snapshot(self.last_timestamp);
        if tuples.is_empty() {
            buffer.clean();
            return Ok(());
        }

        let session = HttpSessionProvider::global().get(&self.host).await?;
        for batch in tuples.chunks(self.max_batch) {
            let body = self.batch_body(batch);
            debug!(
                channel = %self.channel.name(),
                lines = batch.len(),
                "posting batch"
            );

            let mut request = session
                .client()
                .post(&self.url)
                .header(USER_AGENT, crate::api::USER_AGENT)
                .timeout(self.timeout)
                .body(body);
            if let Some(user) = &self.username {
                request = request.basic_auth(user, self.password.as_deref());
            }

            let response = request.send().await;
            match response {
                // InfluxDB acknowledges writes with 204
                Ok(resp) if resp.status().is_success() => {},
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let message = resp.text().await.unwrap_or_default();
                    buffer.requeue_failed(None);
                    return Err(UploadError::Remote { status, message });
                },
                Err(e) => {
                    buffer.requeue_failed(None);
                    return Err(UploadError::Network(e));
                },
            }
        }
        drop(session);

        self.last_timestamp = tuples
            .iter()
            .map(|r| r.time_ms())
            .max()
            .unwrap_or(self.last_timestamp);
        buffer.clean();
        Ok(())
    }

    async fn register_device(&mut self) -> Result<()> {
        // the database is provisioned out of band
        info!(
            channel = %self.channel.name(),
            host = %self.host,
            "influxdb needs no device registration"
        );
        Ok(())
    }
}
