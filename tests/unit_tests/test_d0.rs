// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use meterd_rs::{
    meter::{MeterDriver, d0::MeterD0},
    model::{obis::Obis, reading::ReadingIdentifier},
};
use tokio::io::AsyncWriteExt;

async fn run_driver(input: &[u8], wait_sync: bool) -> Result<Vec<meterd_rs::model::reading::Reading>> {
    let (mut feeder, meter_side) = tokio::io::duplex(4096);
    let mut driver =
        MeterD0::with_stream("mtr-test", Box::new(meter_side)).wait_sync_end(wait_sync);
    driver.open().await?;

    feeder.write_all(input).await?;
    // end of stream counts as a benign timeout for the parser
    drop(feeder);

    let mut readings = Vec::new();
    let n = driver.read(&mut readings, 32).await?;
    assert_eq!(n, readings.len());
    driver.close().await?;
    Ok(readings)
}

/// Hager eHZ single telegram: exactly one reading with the full OBIS id.
#[tokio::test]
async fn hager_ehz_single_telegram() -> Result<()> {
    let telegram = b"/HAG5eHZ010C_EHZ1vA02\r\n1-0:1.8.0*255(000001.2963)\r\n!\n";
    let readings = run_driver(telegram, false).await?;

    assert_eq!(readings.len(), 1);
    let expected = ReadingIdentifier::Obis(Obis::new(1, 0, 1, 8, 0, 255));
    assert_eq!(readings[0].identifier(), &expected);
    assert_eq!(readings[0].value(), 1.2963);
    Ok(())
}

/// Landis+Gyr style multi-line telegram: all eight readings, input order.
#[tokio::test]
async fn landis_gyr_multi_line() -> Result<()> {
    let mut telegram = b"/LGZ4ZMD120AC\r\n".to_vec();
    let lines = [
        ("1-0:1.8.0", 10.1),
        ("1-0:2.8.0", 20.2),
        ("1-0:1.7.0", 1.5),
        ("1-0:21.7.0", 0.5),
        ("1-0:41.7.0", 0.4),
        ("1-0:61.7.0", 0.6),
        ("1-0:32.7.0", 230.1),
        ("1-0:52.7.0", 231.2),
    ];
    for (code, value) in lines {
        telegram.extend_from_slice(format!("{code}({value}*kWh)\r\n").as_bytes());
    }
    telegram.extend_from_slice(b"!\n");

    let readings = run_driver(&telegram, false).await?;
    assert_eq!(readings.len(), 8);
    for ((code, value), rd) in lines.iter().zip(&readings) {
        let expected = ReadingIdentifier::Obis(Obis::parse(code)?);
        assert_eq!(rd.identifier(), &expected);
        assert_eq!(rd.value(), *value);
    }
    // acquisition order is preserved for the uploader
    for pair in readings.windows(2) {
        assert!(pair[0].time() <= pair[1].time());
    }
    Ok(())
}

/// wait_sync "end": garbage before the first `!` is discarded silently.
#[tokio::test]
async fn wait_sync_end_skips_partial_telegram() -> Result<()> {
    let mut input = Vec::new();
    input.extend_from_slice(b"32.7.0(229.8)\r\ncorrupted garbage \x01\x02");
    input.extend_from_slice(b"!");
    input.extend_from_slice(b"/HAG5eHZ010C_EHZ1vA02\r\n2-1:2.3.4*255(999999.9999)\r\n!\n");

    let readings = run_driver(&input, true).await?;
    assert_eq!(readings.len(), 1);
    let expected = ReadingIdentifier::Obis(Obis::new(2, 1, 2, 3, 4, 255));
    assert_eq!(readings[0].identifier(), &expected);
    assert_eq!(readings[0].value(), 999999.9999);
    Ok(())
}

/// The deliberate group filter: only OBIS codes starting with 1, 2 or C
/// produce readings.
#[tokio::test]
async fn leading_group_filter_is_preserved() -> Result<()> {
    let telegram = b"/HAG5eHZ010C_EHZ1vA02\r\n\
        1-0:1.8.0(1.0)\r\n\
        0-0:96.1.0(12345678)\r\n\
        C.1.0(98765)\r\n\
        3-0:1.8.0(7.0)\r\n\
        2-0:2.8.0(2.0)\r\n\
        !\n";
    let readings = run_driver(telegram, false).await?;

    let codes: Vec<String> = readings
        .iter()
        .map(|r| r.identifier().to_string())
        .collect();
    assert_eq!(readings.len(), 3, "got {codes:?}");
    assert_eq!(readings[0].value(), 1.0);
    assert_eq!(readings[1].value(), 98765.0);
    assert_eq!(readings[2].value(), 2.0);
    Ok(())
}

/// Historical value groups after the first one are ignored.
#[tokio::test]
async fn only_first_value_group_is_captured() -> Result<()> {
    let telegram =
        b"/LGZ4ZMD120AC\r\n1-0:1.8.0(100.5*kWh)(99.1)(98.2)\r\n!\n";
    let readings = run_driver(telegram, false).await?;
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].value(), 100.5);
    Ok(())
}

/// A timeout mid-telegram abandons it without producing readings.
#[tokio::test]
async fn timeout_returns_zero_readings() -> Result<()> {
    // stream ends (EOF) before the telegram terminator
    let readings = run_driver(b"/HAG5eHZ010C_EHZ1vA02\r\n1-0:1.8", false).await?;
    assert!(readings.is_empty());
    Ok(())
}

/// The TCP transport speaks the same telegrams as the serial line.
#[tokio::test]
async fn tcp_transport_end_to_end() -> Result<()> {
    use meterd_rs::cfg::config::MeterConfig;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let telegram = b"/HAG5eHZ010C_EHZ1vA02\r\n1-0:1.8.0*255(42.5)\r\n!\n";
            let _ = socket.write_all(telegram).await;
        }
    });

    let cfg: MeterConfig = serde_json::from_str(&format!(
        r#"{{"protocol":"d0","host":"{addr}"}}"#
    ))?;
    let mut driver = MeterD0::from_config(&cfg, "mtr-tcp")?;
    driver.open().await?;

    let mut readings = Vec::new();
    let n = driver.read(&mut readings, 32).await?;
    driver.close().await?;

    assert_eq!(n, 1);
    assert_eq!(readings[0].value(), 42.5);
    Ok(())
}
