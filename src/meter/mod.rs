// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    cfg::config::MeterConfig,
    model::{
        obis::Obis,
        reading::{Reading, ReadingIdentifier},
    },
};

pub mod d0;
pub mod oms;

/// Byte transport a driver can run over: a serial line, a TCP socket, or an
/// in-memory stream injected by tests.
pub trait AsyncLink:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncLink for T {}

/// Wire protocol a meter speaks.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    #[serde(rename = "d0", alias = "D0")]
    D0,
    #[serde(rename = "oms", alias = "OMS")]
    Oms,
}

/// Compile-time metadata per protocol.
pub struct ProtocolDetails {
    pub name: &'static str,
    pub description: &'static str,
    /// Upper bound on how many readings one `read()` may return; sizes the
    /// caller's vector.
    pub max_readings: usize,
    /// Whether the supervisor must sleep `interval` between calls.
    pub periodic: bool,
}

static D0_DETAILS: ProtocolDetails = ProtocolDetails {
    name: "d0",
    description: "DLMS/IEC 62056-21 plaintext protocol",
    max_readings: 32,
    periodic: false,
};

static OMS_DETAILS: ProtocolDetails = ProtocolDetails {
    name: "oms",
    description: "OMS (wireless) M-Bus, slave side",
    max_readings: 32,
    periodic: false,
};

impl ProtocolKind {
    pub fn details(&self) -> &'static ProtocolDetails {
        match self {
            ProtocolKind::D0 => &D0_DETAILS,
            ProtocolKind::Oms => &OMS_DETAILS,
        }
    }

    /// Parses a configuration identifier token in the context of this
    /// protocol. Both supported protocols emit OBIS-identified readings.
    pub fn parse_identifier(&self, s: &str) -> Result<ReadingIdentifier> {
        match self {
            ProtocolKind::D0 | ProtocolKind::Oms => {
                let obis: Obis = s
                    .parse()
                    .with_context(|| format!("cannot parse OBIS id {s:?}"))?;
                Ok(ReadingIdentifier::Obis(obis))
            },
        }
    }
}

/// Contract every protocol driver fulfils.
///
/// `read` blocks (at an await point) until the meter produced data or the
/// driver's own timeout expired; returning 0 readings on a benign timeout
/// is fine. `open` must be idempotent against a prior failed open.
#[async_trait]
pub trait MeterDriver: Send {
    async fn open(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Acquires up to `n` readings into `out`, returning how many were
    /// produced. `out` is cleared first.
    async fn read(&mut self, out: &mut Vec<Reading>, n: usize) -> Result<usize>;

    /// Whether the `interval` config option means anything for this driver
    /// (self-clocked protocols ignore it).
    fn allow_interval(&self) -> bool {
        true
    }
}

/// A configured meter: protocol, driver and scheduling state.
pub struct Meter {
    name: String,
    protocol: ProtocolKind,
    driver: Box<dyn MeterDriver>,
    interval: i64,
    enabled: bool,
}

impl Meter {
    /// Builds the meter plus its protocol driver from configuration. The
    /// name comes from a sequence owned by the supervisor so it stays
    /// process-unique.
    pub fn from_config(cfg: &MeterConfig, name: String) -> Result<Self> {
        let driver: Box<dyn MeterDriver> = match cfg.protocol {
            ProtocolKind::D0 => Box::new(d0::MeterD0::from_config(cfg, &name)?),
            ProtocolKind::Oms => Box::new(oms::MeterOms::from_config(cfg, &name)?),
        };

        Ok(Self {
            name,
            protocol: cfg.protocol,
            driver,
            interval: cfg.interval,
            enabled: cfg.enabled,
        })
    }

    /// Test/bench constructor wiring an externally built driver.
    pub fn with_driver(
        name: String,
        protocol: ProtocolKind,
        driver: Box<dyn MeterDriver>,
        interval: i64,
    ) -> Self {
        Self {
            name,
            protocol,
            driver,
            interval,
            enabled: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn set_interval(&mut self, interval: i64) {
        self.interval = interval;
    }

    pub fn allow_interval(&self) -> bool {
        self.driver.allow_interval()
    }

    pub async fn open(&mut self) -> Result<()> {
        self.driver.open().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.driver.close().await
    }

    pub async fn read(&mut self, out: &mut Vec<Reading>, n: usize) -> Result<usize> {
        self.driver.read(out, n).await
    }
}
