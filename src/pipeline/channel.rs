// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::Buffer,
    cfg::config::{ChannelConfig, LocalConfig},
    meter::ProtocolKind,
    model::reading::{Reading, ReadingIdentifier},
};

/// One logical time-series: an identifier filter over a meter's readings,
/// the buffer towards the middleware, and the wake-up plumbing between
/// reader, uploader and the local view.
pub struct Channel {
    name: String,
    config: ChannelConfig,
    identifier: ReadingIdentifier,
    buffer: Buffer,
    last: Mutex<Option<Reading>>,
    /// Uploader wake-up; a permit is stored so a push before the uploader
    /// listens is never lost.
    notify: Notify,
    /// Broadcast towards local-view long polls.
    observers: Notify,
}

impl Channel {
    pub fn from_config(
        config: ChannelConfig,
        protocol: ProtocolKind,
        name: String,
        local: &LocalConfig,
    ) -> Result<Arc<Self>> {
        let identifier = match &config.identifier {
            Some(id) => protocol.parse_identifier(id)?,
            None => ReadingIdentifier::Nil,
        };

        let buffer = Buffer::new(config.aggmode);
        buffer.set_keep(config.keep_hint(local));

        Ok(Arc::new(Self {
            name,
            config,
            identifier,
            buffer,
            last: Mutex::new(None),
            notify: Notify::new(),
            observers: Notify::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.config.uuid
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn identifier(&self) -> &ReadingIdentifier {
        &self.identifier
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn push(&self, rd: Reading) {
        self.buffer.push(rd);
    }

    /// Most recent reading routed into this channel.
    pub fn last(&self) -> Option<Reading> {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Remembers `rd` as the latest sample if it is newer than the current
    /// one.
    pub fn update_last(&self, rd: &Reading) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let newer = last.as_ref().is_none_or(|l| l.time() < rd.time());
        if newer {
            *last = Some(rd.clone());
        }
    }

    /// Wakes the uploader and any local-view poller after a dispatch round.
    pub fn notify_new(&self) {
        self.notify.notify_one();
        self.observers.notify_waiters();
    }

    /// Blocks until new values arrived; false when shutdown was requested
    /// instead.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.buffer.take_new_values() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = self.notify.notified() => {},
            }
        }
    }

    /// One observer wake-up, used by local-view long polling.
    pub async fn observe(&self) {
        self.observers.notified().await;
    }

    /// Channel with filled-in middleware endpoints, for exercising the API
    /// bindings without a config file.
    pub fn for_tests(name: &str, uuid: &str) -> Arc<Self> {
        let config = ChannelConfig {
            uuid: uuid.to_string(),
            middleware: Some("http://localhost/middleware.php".to_string()),
            host: Some("http://localhost:8086".to_string()),
            database: Some("meterd".to_string()),
            secret_key: Some("not-a-secret".to_string()),
            ..ChannelConfig::default()
        };
        Arc::new(Self {
            name: name.to_string(),
            identifier: ReadingIdentifier::Nil,
            buffer: Buffer::new(config.aggmode),
            config,
            last: Mutex::new(None),
            notify: Notify::new(),
            observers: Notify::new(),
        })
    }
}
