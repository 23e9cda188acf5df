// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeZone, Utc};

use crate::model::obis::Obis;

/// Identifier attached to a reading and used as the channel routing filter.
///
/// Comparison happens through [`ReadingIdentifier::matches`] only; OBIS
/// wildcard semantics live inside that one function. Variants of different
/// kinds never match.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingIdentifier {
    Obis(Obis),
    /// Free-form token, byte-exact equality.
    String(String),
    /// Signed sensor index: sign encodes the direction (positive = power,
    /// negative = consumption), |n| - 1 is the physical channel. The +1
    /// offset keeps +0 and -0 distinct.
    Channel(i32),
    /// Matches only Nil.
    Nil,
}

impl ReadingIdentifier {
    /// Routing predicate. OBIS ids honour the 0xff wildcard on either side.
    pub fn matches(&self, other: &ReadingIdentifier) -> bool {
        match (self, other) {
            (Self::Obis(l), Self::Obis(r)) => l.matches(r),
            (Self::String(l), Self::String(r)) => l == r,
            (Self::Channel(l), Self::Channel(r)) => l == r,
            (Self::Nil, Self::Nil) => true,
            _ => false,
        }
    }

    /// Parses the `sensor{n}/{power|consumption}` form used by sensor-board
    /// style meters.
    pub fn parse_sensor_channel(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("sensor")
            .with_context(|| format!("invalid channel identifier {s:?}"))?;
        let (num, kind) = rest
            .split_once('/')
            .with_context(|| format!("invalid channel identifier {s:?}"))?;
        let n: i32 = num
            .parse()
            .with_context(|| format!("invalid sensor number in {s:?}"))?;

        // increment by 1 to distinguish between +0 and -0
        let channel = n + 1;
        match kind {
            "power" => Ok(Self::Channel(channel)),
            "consumption" => Ok(Self::Channel(-channel)),
            other => bail!("invalid channel type {other:?}"),
        }
    }
}

impl fmt::Display for ReadingIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Obis(o) => o.fmt(f),
            Self::String(s) => f.write_str(s),
            Self::Channel(c) => write!(
                f,
                "sensor{}/{}",
                c.abs() - 1,
                if *c > 0 { "power" } else { "consumption" }
            ),
            Self::Nil => f.write_str("nil"),
        }
    }
}

/// A single metered sample: value, acquisition time and identifier.
///
/// Value and time never change once the reading sits in a channel buffer;
/// only the delete marker flips (and the aggregation survivor is rewritten
/// under the buffer lock before any snapshot observes it).
#[derive(Debug, Clone)]
pub struct Reading {
    value: f64,
    time: DateTime<Utc>,
    identifier: ReadingIdentifier,
    deleted: bool,
}

impl Reading {
    pub fn new(value: f64, time: DateTime<Utc>, identifier: ReadingIdentifier) -> Self {
        Self {
            value,
            time,
            identifier,
            deleted: false,
        }
    }

    /// Reading stamped with the current wall clock.
    pub fn now(value: f64, identifier: ReadingIdentifier) -> Self {
        Self::new(value, Utc::now(), identifier)
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub fn identifier(&self) -> &ReadingIdentifier {
        &self.identifier
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Milliseconds since the Unix epoch; fits an i64 until year 292278994.
    pub fn time_ms(&self) -> i64 {
        self.time.timestamp_millis()
    }

    /// Whole seconds plus the sub-second microseconds.
    pub fn time_parts(&self) -> (i64, u32) {
        (self.time.timestamp(), self.time.timestamp_subsec_micros())
    }

    pub fn set_time(&mut self, time: DateTime<Utc>) {
        self.time = time;
    }

    /// Builds the timestamp from fractional epoch seconds, the form meter
    /// telegrams carry.
    pub fn time_from_epoch_secs(secs: f64) -> DateTime<Utc> {
        let whole = secs.trunc() as i64;
        let micros = ((secs - secs.trunc()) * 1e6) as u32;
        Utc.timestamp_opt(whole, micros * 1000)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn mark_delete(&mut self) {
        self.deleted = true;
    }

    pub fn reset_delete(&mut self) {
        self.deleted = false;
    }
}
