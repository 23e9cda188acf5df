// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use meterd_rs::{
    api::push::{PushDataList, PushDataServer},
    cfg::{
        cli::{parse_args, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
    local::{self, LocalSource},
    mqtt::MqttSink,
    pipeline::{Sinks, supervisor::Supervisor},
};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let cfg = resolve_config_path(&args.config)
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let _log_guard = init_logger(&cfg)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting"
    );

    let mut supervisor = Supervisor::from_config(&cfg)?;

    if args.register {
        supervisor.register().await?;
        info!("registration done");
        return Ok(());
    }

    let cancel = supervisor.cancel_token();

    let mut sinks = Sinks::default();
    if !cfg.push.is_empty() {
        let list = Arc::new(PushDataList::new());
        sinks.push = Some(Arc::clone(&list));
        let server = PushDataServer::new(&cfg.push);
        let push_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = push_cancel.cancelled() => break,
                    _ = server.wait_and_send_once(&list) => {},
                }
            }
        });
    }
    if let Some(mqtt_cfg) = cfg.mqtt.as_ref().filter(|m| m.enabled) {
        let sink = MqttSink::start(mqtt_cfg, cancel.clone())
            .context("cannot start mqtt client")?;
        sinks.mqtt = Some(Arc::new(sink));
    }

    supervisor.start(sinks).await?;

    if cfg.local.enabled {
        let source = LocalSource::new(supervisor.views());
        let local_cfg = cfg.local.clone();
        let local_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = local::serve(source, local_cfg, local_cancel).await {
                error!(error = %e, "local interface stopped");
            }
        });
    }

    if cfg.daemon || cfg.local.enabled {
        spawn_signal_listener(cancel.clone())?;
    }

    supervisor.join().await;
    supervisor.cancel();
    info!("bye");
    Ok(())
}

/// SIGINT, SIGHUP and SIGTERM all request the same cooperative shutdown.
fn spawn_signal_listener(cancel: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => warn!("got SIGINT"),
            _ = hangup.recv() => warn!("got SIGHUP"),
            _ = terminate.recv() => warn!("got SIGTERM"),
        }
        cancel.cancel();
    });
    Ok(())
}
