// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde_json::json;
use tokio::{sync::Notify, time::timeout};
use tracing::{debug, error, warn};

use crate::{api::session::HttpSessionProvider, cfg::config::PushTarget};

/// Granularity of the sender's wait; an empty round on expiry is normal.
const WAIT_SLICE: Duration = Duration::from_secs(5);

/// Readings queued per uuid for the push egress, fed straight from the
/// reader dispatch.
#[derive(Default)]
pub struct PushDataList {
    inner: Mutex<HashMap<String, Vec<(i64, f64)>>>,
    notify: Notify,
}

impl PushDataList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, uuid: &str, t_ms: i64, value: f64) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(uuid.to_string())
            .or_default()
            .push((t_ms, value));
        self.notify.notify_one();
    }

    /// Waits up to the slice interval for queued data, draining it all.
    pub async fn wait_for_data(&self) -> Option<HashMap<String, Vec<(i64, f64)>>> {
        loop {
            {
                let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if !map.is_empty() {
                    return Some(std::mem::take(&mut *map));
                }
            }
            if timeout(WAIT_SLICE, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }
}

/// Fans queued readings out to every configured push middleware as
/// `{"data":[{"uuid":u,"tuples":[[t_ms,v],...]},...]}`.
pub struct PushDataServer {
    urls: Vec<String>,
    timeout: Duration,
}

impl PushDataServer {
    pub fn new(targets: &[PushTarget]) -> Self {
        Self {
            urls: targets.iter().map(|t| t.url.clone()).collect(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn generate_json(data: &HashMap<String, Vec<(i64, f64)>>) -> serde_json::Value {
        let entries: Vec<_> = data
            .iter()
            .map(|(uuid, tuples)| {
                json!({
                    "uuid": uuid,
                    "tuples": tuples
                        .iter()
                        .map(|(t, v)| json!([t, v]))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        json!({ "data": entries })
    }

    /// One wait-and-fan-out round; false when nothing was sent everywhere.
    pub async fn wait_and_send_once(&self, list: &PushDataList) -> bool {
        let Some(data) = list.wait_for_data().await else {
            return false;
        };

        let body = Self::generate_json(&data).to_string();
        debug!(body = %body, "push payload");

        let mut all_ok = true;
        for url in &self.urls {
            if !self.post(url, &body).await {
                all_ok = false;
            }
        }
        all_ok
    }

    async fn post(&self, url: &str, body: &str) -> bool {
        let session = match HttpSessionProvider::global().get(url).await {
            Ok(s) => s,
            Err(e) => {
                error!(url = %url, error = %e, "no session for push target");
                return false;
            },
        };

        let result = session
            .client()
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, crate::api::USER_AGENT)
            .timeout(self.timeout)
            .body(body.to_string())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(url = %url, code = resp.status().as_u16(), "push rejected");
                false
            },
            Err(e) => {
                warn!(url = %url, error = %e, "push failed");
                false
            },
        }
    }
}
