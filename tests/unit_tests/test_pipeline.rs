// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::{Router, extract::State, routing::post};
use meterd_rs::{
    api::{ApiClient, volkszaehler::Volkszaehler},
    cfg::config::{ChannelConfig, LocalConfig},
    meter::{Meter, ProtocolKind, d0::MeterD0},
    pipeline::{
        Sinks,
        channel::Channel,
        reader::{ReaderOpts, reading_loop},
    },
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

type Bodies = Arc<Mutex<Vec<String>>>;

async fn capture_endpoint(State(bodies): State<Bodies>, body: String) -> &'static str {
    bodies
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(body);
    "[]"
}

async fn start_middleware() -> Result<(Bodies, String)> {
    let bodies: Bodies = Arc::new(Mutex::new(Vec::new()));
    let router = Router::new()
        .route("/data/{file}", post(capture_endpoint))
        .with_state(Arc::clone(&bodies));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((bodies, format!("http://{addr}")))
}

/// Telegram in, middleware JSON out: a reader pass routes every matching
/// line into the channel, and one upload round posts all tuples in
/// acquisition order.
#[tokio::test]
async fn telegram_reaches_the_middleware_in_order() -> Result<()> {
    let (bodies, url) = start_middleware().await?;

    let mut telegram = b"/LGZ4ZMD120AC\r\n".to_vec();
    let values = [10.0, 10.5, 11.0, 11.5, 12.0, 12.5, 13.0, 13.5];
    for v in values {
        telegram.extend_from_slice(format!("1-0:1.8.0*255({v}*kWh)\r\n").as_bytes());
    }
    telegram.extend_from_slice(b"!\n");

    let (mut feeder, meter_side) = tokio::io::duplex(4096);
    feeder.write_all(&telegram).await?;
    drop(feeder);

    let driver = MeterD0::with_stream("mtr-e2e", Box::new(meter_side));
    let meter = Meter::with_driver(
        "mtr-e2e".to_string(),
        ProtocolKind::D0,
        Box::new(driver),
        -1,
    );

    let cfg = ChannelConfig {
        uuid: "0e6c3fb7-40bd-4c8c-9b5d-4f9d3a7e8a11".to_string(),
        middleware: Some(url),
        identifier: Some("1-0:1.8.0".to_string()),
        ..ChannelConfig::default()
    };
    let ch = Channel::from_config(
        cfg,
        ProtocolKind::D0,
        "chn-e2e".to_string(),
        &LocalConfig::default(),
    )?;

    // one-shot pass: read, dispatch, notify, return
    let opts = ReaderOpts {
        daemon: false,
        local: false,
    };
    reading_loop(
        meter,
        vec![Arc::clone(&ch)],
        Sinks::default(),
        opts,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(ch.buffer().len(), values.len());
    assert_eq!(ch.last().map(|r| r.value()), Some(13.5));

    let mut api = Volkszaehler::new(Arc::clone(&ch))?;
    api.send().await?;
    assert!(ch.buffer().is_empty());

    let bodies = bodies.lock().unwrap_or_else(|e| e.into_inner()).clone();
    assert_eq!(bodies.len(), 1);
    let sent: Vec<(i64, f64)> = serde_json::from_str::<Vec<(f64, f64)>>(&bodies[0])?
        .into_iter()
        .map(|(t, v)| (t as i64, v))
        .collect();
    assert_eq!(sent.len(), values.len());
    for (i, (_, v)) in sent.iter().enumerate() {
        assert_eq!(*v, values[i], "tuple {i} out of order");
    }
    for pair in sent.windows(2) {
        assert!(pair[0].0 <= pair[1].0, "timestamps must not go backwards");
    }
    Ok(())
}

/// A reading routed by a wildcard filter may land in several channels.
#[tokio::test]
async fn overlapping_wildcard_channels_both_receive() -> Result<()> {
    let mut telegram = b"/HAG5eHZ010C_EHZ1vA02\r\n".to_vec();
    telegram.extend_from_slice(b"1-0:1.8.0*255(5.5)\r\n!\n");

    let (mut feeder, meter_side) = tokio::io::duplex(4096);
    feeder.write_all(&telegram).await?;
    drop(feeder);

    let driver = MeterD0::with_stream("mtr-wild", Box::new(meter_side));
    let meter = Meter::with_driver(
        "mtr-wild".to_string(),
        ProtocolKind::D0,
        Box::new(driver),
        -1,
    );

    let mk = |uuid: &str, identifier: &str| -> Result<Arc<Channel>> {
        Channel::from_config(
            ChannelConfig {
                uuid: uuid.to_string(),
                middleware: Some("http://localhost/mw".to_string()),
                identifier: Some(identifier.to_string()),
                ..ChannelConfig::default()
            },
            ProtocolKind::D0,
            uuid.to_string(),
            &LocalConfig::default(),
        )
    };
    let exact = mk("chn-exact", "1-0:1.8.0*255")?;
    let pattern = mk("chn-pattern", "1.8.0")?;
    let other = mk("chn-other", "2.8.0")?;

    reading_loop(
        meter,
        vec![
            Arc::clone(&exact),
            Arc::clone(&pattern),
            Arc::clone(&other),
        ],
        Sinks::default(),
        ReaderOpts {
            daemon: false,
            local: false,
        },
        CancellationToken::new(),
    )
    .await;

    assert_eq!(exact.buffer().len(), 1);
    assert_eq!(pattern.buffer().len(), 1);
    assert!(other.buffer().is_empty(), "non-matching channel stays empty");
    Ok(())
}
