// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    meter::Meter,
    model::reading::Reading,
    pipeline::{Sinks, channel::Channel},
};

/// Scheduling flags the reader inherits from the global configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOpts {
    pub daemon: bool,
    pub local: bool,
}

impl ReaderOpts {
    fn keep_running(&self) -> bool {
        self.daemon || self.local
    }
}

/// Per-meter acquisition loop: read, learn the meter's cadence, route each
/// reading into every channel whose identifier matches, wake the
/// downstream consumers.
///
/// A transport error ends the loop for this meter only; the rest of the
/// process keeps running.
pub async fn reading_loop(
    mut meter: Meter,
    channels: Vec<Arc<Channel>>,
    sinks: Sinks,
    opts: ReaderOpts,
    cancel: CancellationToken,
) {
    let details = meter.protocol().details();
    let mut readings: Vec<Reading> = Vec::with_capacity(details.max_readings);

    debug!(meter = %meter.name(), max_readings = details.max_readings, "reader started");

    loop {
        let started = Instant::now();
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = meter.read(&mut readings, details.max_readings) => match read {
                Ok(n) => n,
                Err(e) => {
                    error!(meter = %meter.name(), error = %e, "read failed, stopping meter");
                    break;
                },
            },
        };
        let delta = started.elapsed().as_secs() as i64;

        debug!(meter = %meter.name(), count = n, "got new readings");

        // non-periodic meters dictate their own cadence; remember it so
        // retention hints and the local view can reason about it
        if !details.periodic && delta > 0 && delta != meter.interval() {
            debug!(meter = %meter.name(), interval = delta, "updating interval");
            meter.set_interval(delta);
        }

        for ch in &channels {
            dispatch(ch, &readings[..n], &sinks);
            ch.notify_new();

            if tracing::enabled!(tracing::Level::DEBUG) {
                let mut dump = String::new();
                if ch.buffer().dump(&mut dump, 1024).is_some() {
                    debug!(
                        channel = %ch.name(),
                        size = ch.buffer().len(),
                        keep = ch.buffer().keep(),
                        dump = %dump,
                        "buffer state"
                    );
                }
            }
        }

        if details.periodic && opts.keep_running() {
            let interval = meter.interval();
            if interval > 0 {
                info!(meter = %meter.name(), interval, "next reading scheduled");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(Duration::from_secs(interval as u64)) => {},
                }
            }
        }

        if !opts.keep_running() {
            break;
        }
    }

    if let Err(e) = meter.close().await {
        error!(meter = %meter.name(), error = %e, "close failed");
    }
    debug!(meter = %meter.name(), "stop reading");
}

/// Routes matching readings into one channel. A reading may match several
/// channels with overlapping wildcard filters; unmatched readings are
/// discarded.
fn dispatch(ch: &Arc<Channel>, readings: &[Reading], sinks: &Sinks) {
    for rd in readings {
        if !rd.identifier().matches(ch.identifier()) {
            continue;
        }

        ch.update_last(rd);
        info!(
            channel = %ch.name(),
            value = rd.value(),
            ts = rd.time_ms(),
            "adding reading to queue"
        );
        ch.push(rd.clone());

        if let Some(push) = &sinks.push {
            push.add(ch.uuid(), rd.time_ms(), rd.value());
        }
        if let Some(mqtt) = &sinks.mqtt {
            mqtt.publish(ch.name(), rd);
        }
    }
}
