// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{cfg::config::MqttConfig, model::reading::Reading};

/// Publishes every routed reading to `{prefix}{channel}/raw` as a small
/// JSON document. Publishing is non-blocking; a full queue drops the
/// sample rather than stalling the reader.
pub struct MqttSink {
    client: AsyncClient,
    topic: String,
    qos: QoS,
    retain: bool,
}

impl MqttSink {
    /// Connects and spawns the broker event loop; it reconnects with a
    /// one-second backoff until shutdown.
    pub fn start(cfg: &MqttConfig, cancel: CancellationToken) -> Result<Self> {
        let client_id = format!("meterd_{}", std::process::id());
        let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
            opts.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 16);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(ev) => trace!(?ev, "mqtt event"),
                        Err(e) => {
                            warn!(error = %e, "mqtt connection lost");
                            sleep(Duration::from_secs(1)).await;
                        },
                    },
                }
            }
            debug!("mqtt event loop stopped");
        });

        Ok(Self {
            client,
            topic: cfg.topic.clone(),
            qos: match cfg.qos {
                0 => QoS::AtMostOnce,
                1 => QoS::AtLeastOnce,
                _ => QoS::ExactlyOnce,
            },
            retain: cfg.retain,
        })
    }

    pub fn publish(&self, channel_name: &str, rd: &Reading) {
        let topic = format!("{}{}/raw", self.topic, channel_name);
        let payload = json!({
            "timestamp": rd.time_ms(),
            "value": rd.value(),
        })
        .to_string();

        trace!(topic = %topic, payload = %payload, "publish");
        if let Err(e) = self
            .client
            .try_publish(&topic, self.qos, self.retain, payload)
        {
            warn!(topic = %topic, error = %e, "publish failed");
        }
    }
}
