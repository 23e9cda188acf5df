// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    api::{self, ApiClient},
    buffer::AggMode,
    cfg::config::Config,
    meter::Meter,
    pipeline::{
        Sinks,
        channel::Channel,
        reader::{ReaderOpts, reading_loop},
    },
};

/// What the supervisor keeps about a meter after its reader task took the
/// driver away; the local surface reads from this.
pub struct MeterView {
    pub meter_name: String,
    pub protocol: &'static str,
    pub channels: Vec<Arc<Channel>>,
}

/// Owns the meter/channel tree: builds it from configuration, starts one
/// reader task per meter and one uploader task per channel, and tears
/// everything down through one cancellation token.
pub struct Supervisor {
    maps: Vec<(Meter, Vec<Arc<Channel>>)>,
    views: Vec<MeterView>,
    cancel: CancellationToken,
    reader_handles: Vec<(String, JoinHandle<()>)>,
    uploader_handles: Vec<(String, JoinHandle<()>)>,
    daemon: bool,
    local: bool,
    retry: Duration,
}

impl Supervisor {
    /// Creates every meter, driver and channel up front so configuration
    /// mistakes surface before anything touches hardware. Names are issued
    /// from supervisor-owned sequences and stay process-unique.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut maps = Vec::new();
        let mut views = Vec::new();
        let mut channel_seq = 0usize;

        for (meter_seq, mcfg) in cfg.meters.iter().enumerate() {
            let meter_name = format!("mtr{meter_seq}");
            let meter = Meter::from_config(mcfg, meter_name.clone())
                .with_context(|| format!("meter {meter_name}"))?;

            let mut channels = Vec::with_capacity(mcfg.channels.len());
            for chcfg in &mcfg.channels {
                let name = format!("chn{channel_seq}");
                channel_seq += 1;
                let channel = Channel::from_config(
                    chcfg.clone(),
                    mcfg.protocol,
                    name,
                    &cfg.local,
                )
                .with_context(|| format!("channel {} of {meter_name}", chcfg.uuid))?;
                channels.push(channel);
            }

            views.push(MeterView {
                meter_name,
                protocol: meter.protocol().details().name,
                channels: channels.clone(),
            });
            maps.push((meter, channels));
        }

        Ok(Self {
            maps,
            views,
            cancel: CancellationToken::new(),
            reader_handles: Vec::new(),
            uploader_handles: Vec::new(),
            daemon: cfg.daemon,
            local: cfg.local.enabled,
            retry: Duration::from_secs(cfg.retry),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn views(&self) -> &[MeterView] {
        &self.views
    }

    /// Opens every enabled meter and spawns its reader, plus an uploader
    /// per channel unless the process serves locally without daemonising.
    ///
    /// An open failure is fatal in one-shot mode and skips the meter in
    /// daemon mode.
    pub async fn start(&mut self, sinks: Sinks) -> Result<()> {
        // uploads are pointless for a one-shot local inspection run
        let logging = !self.local || self.daemon;
        let opts = ReaderOpts {
            daemon: self.daemon,
            local: self.local,
        };

        for (mut meter, channels) in std::mem::take(&mut self.maps) {
            if !meter.enabled() {
                debug!(meter = %meter.name(), "skipping disabled meter");
                continue;
            }

            if let Err(e) = meter.open().await {
                error!(meter = %meter.name(), error = %e, "open failed");
                if !self.daemon {
                    return Err(e).with_context(|| {
                        format!("cannot open meter {}", meter.name())
                    });
                }
                continue;
            }
            debug!(meter = %meter.name(), "meter is opened, starting reader");

            // build every api binding first so a bad channel fails the
            // start before any task runs
            let mut apis = Vec::new();
            if logging {
                for ch in &channels {
                    let api = api::create(Arc::clone(ch)).with_context(|| {
                        format!("api for channel {}", ch.uuid())
                    })?;
                    apis.push((Arc::clone(ch), api));
                }
            }

            let name = meter.name().to_string();
            let handle = tokio::spawn(reading_loop(
                meter,
                channels,
                sinks.clone(),
                opts,
                self.cancel.clone(),
            ));
            self.reader_handles.push((name, handle));

            for (ch, api) in apis {
                let name = ch.name().to_string();
                let handle = tokio::spawn(uploader_loop(
                    ch,
                    api,
                    self.retry,
                    self.daemon,
                    self.cancel.clone(),
                ));
                self.uploader_handles.push((name, handle));
            }
        }

        Ok(())
    }

    /// Alternate entry path: announce every channel to its middleware once
    /// and return without starting any loop.
    pub async fn register(&mut self) -> Result<()> {
        for view in &self.views {
            for ch in &view.channels {
                let mut api = api::create(Arc::clone(ch))?;
                api.register_device()
                    .await
                    .with_context(|| format!("registration of {}", ch.uuid()))?;
                info!(channel = %ch.name(), uuid = %ch.uuid(), "registered");
            }
        }
        Ok(())
    }

    /// Requests cooperative shutdown of every reader and uploader.
    pub fn cancel(&self) {
        info!("closing connections to terminate");
        self.cancel.cancel();
    }

    /// Waits for all tasks, in the order they were started: readers first,
    /// then uploaders. Outside daemon mode the uploaders are released once
    /// every reader finished its single pass.
    pub async fn join(&mut self) {
        // a daemon with nothing to supervise still runs until a signal,
        // e.g. when every meter is disabled but the local surface is up
        if self.daemon
            && self.reader_handles.is_empty()
            && self.uploader_handles.is_empty()
        {
            self.cancel.cancelled().await;
        }
        for (name, handle) in self.reader_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "task aborted");
            }
        }
        if !self.daemon {
            self.cancel.cancel();
        }
        for (name, handle) in self.uploader_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "task aborted");
            }
        }
    }
}

/// Per-channel uploader: wait for new values, collapse the aggregation
/// window, post, and pause after failures.
async fn uploader_loop(
    ch: Arc<Channel>,
    mut api: Box<dyn ApiClient>,
    retry: Duration,
    daemon: bool,
    cancel: CancellationToken,
) {
    loop {
        if !ch.wait(&cancel).await {
            break;
        }

        if ch.buffer().aggmode() != AggMode::None {
            let cfg = ch.config();
            ch.buffer().aggregate(cfg.aggtime, cfg.aggfixedinterval);
            ch.buffer().clean();
        }

        if let Err(e) = api.send().await {
            warn!(
                channel = %ch.name(),
                error = %e,
                pause = retry.as_secs(),
                "upload failed, waiting for next request"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(retry) => {},
            }
        }

        if !daemon {
            break;
        }
    }
    debug!(channel = %ch.name(), "stop logging");
}
