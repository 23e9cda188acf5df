// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use meterd_rs::{
    buffer::AggMode,
    cfg::{config::Config, enums::ApiKind},
    meter::ProtocolKind,
    pipeline::supervisor::Supervisor,
};

fn fixture_path() -> String {
    format!(
        "{}/tests/unit_tests/fixtures/meterd.json",
        env!("CARGO_MANIFEST_DIR")
    )
}

#[test]
fn full_fixture_loads_and_normalizes() -> Result<()> {
    let cfg = Config::load_from_file(fixture_path())?;

    assert!(cfg.daemon);
    assert_eq!(cfg.retry, 30);
    assert!(cfg.local.enabled);
    assert_eq!(cfg.local.buffer, 600);
    assert_eq!(cfg.push.len(), 1);

    let mqtt = cfg.mqtt.as_ref().expect("mqtt section");
    assert_eq!(mqtt.topic, "meterd/", "trailing slash gets appended");

    assert_eq!(cfg.meters.len(), 2);
    let d0 = &cfg.meters[0];
    assert_eq!(d0.protocol, ProtocolKind::D0);
    assert_eq!(d0.channels.len(), 2);
    assert_eq!(d0.channels[0].aggmode, AggMode::Max);
    assert_eq!(d0.channels[1].api, ApiKind::Null);

    let oms = &cfg.meters[1];
    assert!(!oms.enabled);
    // single-channel shorthand folded into the list
    assert_eq!(oms.channels.len(), 1);
    assert!(oms.channel.is_none());
    assert_eq!(oms.channels[0].api, ApiKind::InfluxDb);
    Ok(())
}

#[test]
fn supervisor_builds_the_whole_tree() -> Result<()> {
    let cfg = Config::load_from_file(fixture_path())?;
    let supervisor = Supervisor::from_config(&cfg)?;

    let views = supervisor.views();
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].meter_name, "mtr0");
    assert_eq!(views[0].protocol, "d0");
    assert_eq!(views[0].channels.len(), 2);

    // channel names are unique across meters
    assert_eq!(views[0].channels[0].name(), "chn0");
    assert_eq!(views[0].channels[1].name(), "chn1");
    assert_eq!(views[1].channels[0].name(), "chn2");

    // the retention hint follows the local surface configuration
    assert_eq!(views[0].channels[0].buffer().keep(), 600);
    Ok(())
}

#[test]
fn unknown_top_level_keys_are_rejected() {
    let err = serde_json::from_str::<Config>(r#"{"meterz": []}"#);
    assert!(err.is_err());
}

#[test]
fn malformed_file_fails_with_context() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json")?;

    let err = Config::load_from_file(&path).expect_err("must fail");
    assert!(err.to_string().contains("parse"), "unhelpful error: {err:#}");

    assert!(Config::load_from_file(dir.path().join("missing.json")).is_err());
    Ok(())
}

#[test]
fn non_uuid_channel_identifiers_are_rejected() {
    let mut cfg: Config = serde_json::from_str(
        r#"{"meters":[{"protocol":"d0","device":"/dev/ttyS0",
            "channel":{"uuid":"not-a-uuid","middleware":"http://mw"}}]}"#,
    )
    .expect("syntactically valid");
    assert!(cfg.validate_and_normalize().is_err());
}
