// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::{Path, PathBuf}};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::{
    buffer::{AggMode, Buffer},
    cfg::enums::{ApiKind, MsgChannelType, ParityMode},
    meter::ProtocolKind,
};

/// Baud rates the serial transports accept.
pub const BAUDRATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200,
    38400, 57600, 115200, 230400,
];

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Run the reader/uploader loops indefinitely.
    #[serde(default)]
    pub daemon: bool,
    /// Stay attached to the terminal.
    #[serde(default)]
    pub foreground: bool,
    /// Append-mode log file; stderr when unset.
    #[serde(default)]
    pub log: Option<PathBuf>,
    /// Uploader pause after a failed POST, seconds.
    #[serde(default = "default_retry")]
    pub retry: u64,
    /// Log threshold, 0 (errors and warnings) .. 15 (finest).
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default)]
    pub local: LocalConfig,
    /// Additional push egress targets fed from the same reading stream.
    #[serde(default)]
    pub push: Vec<PushTarget>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,
}

/// Parameters of the tiny read-only HTTP surface serving live readings.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_local_port")]
    pub port: u16,
    /// Long-poll timeout in seconds; 0 answers immediately.
    #[serde(default)]
    pub timeout: u64,
    /// How many most-recent readings each channel exposes.
    #[serde(default = "default_local_buffer")]
    pub buffer: usize,
    /// Serve a channel index on `/`.
    #[serde(default)]
    pub index: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_local_port(),
            timeout: 0,
            buffer: default_local_buffer(),
            index: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PushTarget {
    pub url: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    /// Topic prefix; a trailing slash is appended when missing.
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// One physical meter plus the channels fed from it.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    pub protocol: ProtocolKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between reads for periodic protocols; learned from the
    /// meter's cadence otherwise.
    #[serde(default = "default_interval")]
    pub interval: i64,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Single-channel shorthand, folded into `channels` at validation.
    #[serde(default)]
    pub channel: Option<ChannelConfig>,

    /* transport (D0 serial / OMS serial) */
    #[serde(default)]
    pub device: Option<String>,
    /* transport (D0 TCP), `host:port` */
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub baudrate: Option<u32>,
    /// Secondary baud rate for the data phase (two-speed mode switch).
    #[serde(default)]
    pub baudrate_read: Option<u32>,
    #[serde(default)]
    pub parity: Option<ParityMode>,
    /// Hex-encoded byte sequence written to pull the banner.
    #[serde(default)]
    pub pullseq: Option<String>,
    /// Hex-encoded ack bytes, or the literal `"auto"`.
    #[serde(default)]
    pub ackseq: Option<String>,
    /// `"end"` discards input until a telegram boundary on the first read.
    #[serde(default)]
    pub wait_sync: Option<String>,
    /// Read timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,

    /* OMS */
    /// 32 hex chars, the AES-128 key shared with the meter.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub mbus_debug: bool,
    /// Stamp readings with the local clock even when the telegram carries
    /// a time record.
    #[serde(default)]
    pub use_local_time: bool,
}

/// One logical time-series derived from a meter by an identifier filter.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub uuid: String,
    #[serde(default)]
    pub middleware: Option<String>,
    /// OBIS id, alias, or protocol-specific token to filter readings by.
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub api: ApiKind,
    #[serde(default)]
    pub aggmode: AggMode,
    /// Aggregation window in seconds.
    #[serde(default = "default_interval")]
    pub aggtime: i64,
    /// Snap the survivor's timestamp down to a multiple of `aggtime`.
    #[serde(default)]
    pub aggfixedinterval: bool,
    /// POST timeout in seconds.
    #[serde(default = "default_upload_timeout")]
    pub timeout: u64,

    /* influxdb */
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub measurement_name: Option<String>,
    #[serde(default)]
    pub max_batch_inserts: Option<usize>,

    /* mysmartgrid */
    #[serde(default, rename = "secretKey")]
    pub secret_key: Option<String>,
    #[serde(default, rename = "type")]
    pub channel_type: Option<MsgChannelType>,
    #[serde(default)]
    pub device: Option<String>,
    /// Minimum seconds between MySmartGrid posts.
    #[serde(default)]
    pub interval: Option<i64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            middleware: None,
            identifier: None,
            api: ApiKind::default(),
            aggmode: AggMode::default(),
            aggtime: default_interval(),
            aggfixedinterval: false,
            timeout: default_upload_timeout(),
            host: None,
            database: None,
            username: None,
            password: None,
            measurement_name: None,
            max_batch_inserts: None,
            secret_key: None,
            channel_type: None,
            device: None,
            interval: None,
        }
    }
}

impl Config {
    /// Loads the configuration from JSON, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config {:?}", path.as_ref())
        })?;
        let mut cfg: Config =
            serde_json::from_str(&s).context("failed to parse config JSON")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.retry > 0, "retry must be >= 1 second");

        for (i, meter) in self.meters.iter_mut().enumerate() {
            // fold the single-channel shorthand
            if let Some(ch) = meter.channel.take() {
                meter.channels.push(ch);
            }

            match meter.protocol {
                ProtocolKind::D0 => {
                    ensure!(
                        meter.device.is_some() || meter.host.is_some(),
                        "meter #{i}: d0 needs a device or a host"
                    );
                    if let Some(baud) = meter.baudrate {
                        ensure!(
                            BAUDRATES.contains(&baud),
                            "meter #{i}: invalid baudrate {baud}"
                        );
                    }
                    if let Some(baud) = meter.baudrate_read {
                        ensure!(
                            BAUDRATES.contains(&baud),
                            "meter #{i}: invalid baudrate_read {baud}"
                        );
                    }
                    if let Some(seq) = &meter.pullseq {
                        decode_hex_seq(seq)
                            .with_context(|| format!("meter #{i}: pullseq"))?;
                    }
                    if let Some(seq) = &meter.ackseq
                        && seq != "auto"
                    {
                        decode_hex_seq(seq)
                            .with_context(|| format!("meter #{i}: ackseq"))?;
                    }
                    if let Some(sync) = &meter.wait_sync {
                        ensure!(
                            sync == "end",
                            "meter #{i}: wait_sync supports only \"end\""
                        );
                    }
                },
                ProtocolKind::Oms => {
                    let key = meter
                        .key
                        .as_deref()
                        .with_context(|| format!("meter #{i}: oms needs a key"))?;
                    ensure!(
                        key.len() == 32,
                        "meter #{i}: oms key length needs to be 32"
                    );
                    ensure!(
                        hex::decode(key).is_ok(),
                        "meter #{i}: oms key is not valid hex"
                    );
                },
            }

            for ch in &meter.channels {
                ch.validate(meter.protocol)
                    .with_context(|| format!("meter #{i}, channel {}", ch.uuid))?;
            }
        }

        if let Some(mqtt) = &mut self.mqtt {
            ensure!(mqtt.qos <= 2, "mqtt qos must be 0, 1 or 2");
            if !mqtt.topic.is_empty() && !mqtt.topic.ends_with('/') {
                mqtt.topic.push('/');
            }
        }

        for push in &self.push {
            ensure!(!push.url.is_empty(), "push url must not be empty");
        }

        Ok(())
    }
}

impl ChannelConfig {
    fn validate(&self, protocol: ProtocolKind) -> Result<()> {
        ensure!(!self.uuid.is_empty(), "channel uuid must not be empty");

        match self.api {
            ApiKind::Volkszaehler | ApiKind::MySmartGrid => {
                ensure!(
                    self.middleware.is_some(),
                    "api {} needs a middleware url",
                    self.api
                );
                // these middlewares key their channels by UUID
                uuid::Uuid::parse_str(&self.uuid)
                    .with_context(|| format!("invalid channel uuid {:?}", self.uuid))?;
            },
            ApiKind::InfluxDb => {
                ensure!(self.host.is_some(), "api influxdb needs a host");
                ensure!(self.database.is_some(), "api influxdb needs a database");
                ensure!(
                    self.max_batch_inserts != Some(0),
                    "max_batch_inserts must be >= 1"
                );
            },
            ApiKind::Null => {},
        }
        if self.api == ApiKind::MySmartGrid {
            ensure!(
                self.secret_key.is_some(),
                "api mysmartgrid needs a secretKey"
            );
        }

        // fail identifier parsing at startup, not in the reader loop
        if let Some(id) = &self.identifier {
            let _ = protocol
                .parse_identifier(id)
                .with_context(|| format!("invalid identifier {id:?}"))?;
        }
        Ok(())
    }

    /// How many most-recent readings the buffer keeps for the local view.
    pub fn keep_hint(&self, local: &LocalConfig) -> usize {
        if local.enabled {
            local.buffer
        } else {
            Buffer::DEFAULT_KEEP
        }
    }
}

/// Decodes an even-length hex option into raw bytes.
pub fn decode_hex_seq(seq: &str) -> Result<Vec<u8>> {
    hex::decode(seq).with_context(|| format!("invalid hex sequence {seq:?}"))
}

fn default_true() -> bool {
    true
}

fn default_retry() -> u64 {
    15
}

fn default_interval() -> i64 {
    -1
}

fn default_local_port() -> u16 {
    8080
}

fn default_local_buffer() -> usize {
    Buffer::DEFAULT_KEEP
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "meterd/".to_string()
}

fn default_upload_timeout() -> u64 {
    30
}
