// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::Deserialize;

/// Middleware API flavour a channel uploads through.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiKind {
    #[serde(rename = "volkszaehler", alias = "Volkszaehler")]
    #[default]
    Volkszaehler,
    #[serde(rename = "mysmartgrid", alias = "MySmartGrid")]
    MySmartGrid,
    #[serde(rename = "influxdb", alias = "InfluxDB")]
    InfluxDb,
    #[serde(rename = "null", alias = "Null")]
    Null,
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApiKind::Volkszaehler => "volkszaehler",
            ApiKind::MySmartGrid => "mysmartgrid",
            ApiKind::InfluxDb => "influxdb",
            ApiKind::Null => "null",
        })
    }
}

/// Serial line discipline for the plaintext optical/RS-232 link.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParityMode {
    #[serde(rename = "8n1", alias = "8N1")]
    EightN1,
    #[serde(rename = "7n1", alias = "7N1")]
    SevenN1,
    #[serde(rename = "7e1", alias = "7E1")]
    #[default]
    SevenE1,
    #[serde(rename = "7o1", alias = "7O1")]
    SevenO1,
}

impl fmt::Display for ParityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParityMode::EightN1 => "8n1",
            ParityMode::SevenN1 => "7n1",
            ParityMode::SevenE1 => "7e1",
            ParityMode::SevenO1 => "7o1",
        })
    }
}

/// MySmartGrid channel flavour: full device or bare sensor endpoint.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgChannelType {
    #[serde(rename = "device")]
    #[default]
    Device,
    #[serde(rename = "sensor")]
    Sensor,
}

impl fmt::Display for MsgChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MsgChannelType::Device => "device",
            MsgChannelType::Sensor => "sensor",
        })
    }
}
