// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Wildcard group value: matches any byte during comparison.
pub const WILDCARD: u8 = 0xff;

// DIN EN 62056-61 special character codes allowed in the C/D/E groups.
const SC_C: u8 = 96;
const SC_F: u8 = 97;
const SC_L: u8 = 98;
const SC_P: u8 = 99;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObisError {
    #[error("unexpected byte {0:?} in OBIS id")]
    UnexpectedByte(char),
    #[error("OBIS groups C and D are mandatory")]
    MissingGroups,
    #[error("unknown OBIS alias {0:?}")]
    UnknownAlias(String),
}

/// OBIS id as specified in DIN EN 62056-61: six groups `A-B:C.D.E*F`,
/// each 0..=255, where 0xff acts as a wildcard during comparison.
///
/// Group meaning: A medium, B channel, C indicator, D mode, E quantities,
/// F storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Obis([u8; 6]);

impl Obis {
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    pub const fn raw(&self) -> &[u8; 6] {
        &self.0
    }

    pub const fn media(&self) -> u8 {
        self.0[0]
    }

    pub const fn channel(&self) -> u8 {
        self.0[1]
    }

    pub const fn indicator(&self) -> u8 {
        self.0[2]
    }

    pub const fn mode(&self) -> u8 {
        self.0[3]
    }

    pub const fn quantities(&self) -> u8 {
        self.0[4]
    }

    pub const fn storage(&self) -> u8 {
        self.0[5]
    }

    /// Parses the clear-text form `A-B:C.D.E*F`.
    ///
    /// Groups A, B, E and F are optional and default to the wildcard; C and
    /// D are mandatory. `&` is accepted in place of `*`. The letters
    /// C/F/L/P expand to the special service codes 96..=99.
    pub fn parse(s: &str) -> Result<Self, ObisError> {
        // group indices into the raw array
        const A: usize = 0;
        const B: usize = 1;
        const C: usize = 2;
        const D: usize = 3;
        const E: usize = 4;

        let mut raw = [WILDCARD; 6];
        let mut num: u16 = 0;
        // index of the last group terminated by a separator; none seen yet
        let mut group: isize = -1;

        for byte in s.chars() {
            match byte {
                '0'..='9' => {
                    num = num.wrapping_mul(10).wrapping_add(byte as u16 - '0' as u16);
                },
                'C' => num = SC_C as u16,
                'F' => num = SC_F as u16,
                'L' => num = SC_L as u16,
                'P' => num = SC_P as u16,
                _ => {
                    group = match byte {
                        '-' if group < A as isize => A as isize,
                        ':' if group < B as isize => B as isize,
                        '.' if group < D as isize => {
                            if group < C as isize {
                                C as isize
                            } else {
                                D as isize
                            }
                        },
                        '*' | '&' if group == D as isize => E as isize,
                        _ => return Err(ObisError::UnexpectedByte(byte)),
                    };
                    raw[group as usize] = num as u8;
                    num = 0;
                },
            }
        }

        // the trailing group has no separator
        group += 1;
        if group as usize >= raw.len() {
            return Err(ObisError::UnexpectedByte('.'));
        }
        raw[group as usize] = num as u8;

        if group < D as isize {
            return Err(ObisError::MissingGroups);
        }
        Ok(Self(raw))
    }

    /// Resolves a human readable alias ("power", "counter", ...) from the
    /// static table. Lookup is linear and case-sensitive.
    pub fn lookup_alias(alias: &str) -> Result<Self, ObisError> {
        ALIASES
            .iter()
            .find(|a| a.name == alias)
            .map(|a| a.id)
            .ok_or_else(|| ObisError::UnknownAlias(alias.to_string()))
    }

    /// Bytewise comparison where 0xff on either side matches any value.
    ///
    /// This is the routing predicate: a channel configured with wildcard
    /// groups acts as a pattern over incoming readings. No ordering beyond
    /// this equality is defined.
    pub fn matches(&self, other: &Obis) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(l, r)| *l == WILDCARD || *r == WILDCARD || l == r)
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 6]
    }

    pub fn is_manufacturer_specific(&self) -> bool {
        (128..=199).contains(&self.channel())
            || (128..=199).contains(&self.indicator())
            || self.indicator() == 240
            || (128..=254).contains(&self.mode())
            || (128..=254).contains(&self.quantities())
            || (128..=254).contains(&self.storage())
    }

    /// Basic sanity check; OBIS ids are not strictly defined so only the
    /// A, B and F groups are constrained.
    pub fn is_valid(&self) -> bool {
        if self.media() > 9 {
            return false;
        }
        if self.channel() > 64 {
            return false;
        }
        if self.storage() != WILDCARD && self.storage() > 99 {
            return false;
        }
        true
    }
}

impl FromStr for Obis {
    type Err = ObisError;

    /// Clear-text form first, alias table as fallback.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse(s) {
            Ok(id) => Ok(id),
            Err(e) => Self::lookup_alias(s).map_err(|_| e),
        }
    }
}

impl fmt::Display for Obis {
    /// Always emits all six groups as decimals.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}:{}.{}.{}*{}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

struct ObisAlias {
    id: Obis,
    name: &'static str,
    #[allow(dead_code)]
    description: &'static str,
}

const DC: u8 = WILDCARD;

/// Static alias table resolving configuration tokens to concrete ids.
/// Never consulted during routing.
static ALIASES: &[ObisAlias] = &[
    /* general */
    ObisAlias { id: Obis::new(1, 0, 1, 7, DC, DC), name: "power", description: "Wirkleistung (Summe)" },
    ObisAlias { id: Obis::new(1, 0, 21, 7, DC, DC), name: "power-l1", description: "Wirkleistung (Phase 1)" },
    ObisAlias { id: Obis::new(1, 0, 41, 7, DC, DC), name: "power-l2", description: "Wirkleistung (Phase 2)" },
    ObisAlias { id: Obis::new(1, 0, 61, 7, DC, DC), name: "power-l3", description: "Wirkleistung (Phase 3)" },
    ObisAlias { id: Obis::new(1, 0, 12, 7, DC, DC), name: "voltage", description: "Spannung (Mittelwert)" },
    ObisAlias { id: Obis::new(1, 0, 32, 7, DC, DC), name: "voltage-l1", description: "Spannung (Phase 1)" },
    ObisAlias { id: Obis::new(1, 0, 52, 7, DC, DC), name: "voltage-l2", description: "Spannung (Phase 2)" },
    ObisAlias { id: Obis::new(1, 0, 72, 7, DC, DC), name: "voltage-l3", description: "Spannung (Phase 3)" },
    ObisAlias { id: Obis::new(1, 0, 11, 7, DC, DC), name: "current", description: "Stromstaerke (Summe)" },
    ObisAlias { id: Obis::new(1, 0, 31, 7, DC, DC), name: "current-l1", description: "Stromstaerke (Phase 1)" },
    ObisAlias { id: Obis::new(1, 0, 51, 7, DC, DC), name: "current-l2", description: "Stromstaerke (Phase 2)" },
    ObisAlias { id: Obis::new(1, 0, 71, 7, DC, DC), name: "current-l3", description: "Stromstaerke (Phase 3)" },
    ObisAlias { id: Obis::new(1, 0, 14, 7, 0, DC), name: "frequency", description: "Netzfrequenz" },
    ObisAlias { id: Obis::new(1, 0, 12, 7, 0, DC), name: "powerfactor", description: "Leistungsfaktor" },
    ObisAlias { id: Obis::new(0, 0, 96, 1, DC, DC), name: "device", description: "Zaehler Seriennr." },
    ObisAlias { id: Obis::new(1, 0, 96, 5, 5, DC), name: "status", description: "Zaehler Status" },
    ObisAlias { id: Obis::new(1, 0, 1, 8, DC, DC), name: "counter", description: "Zaehlerstand Wirkleistung" },
    ObisAlias { id: Obis::new(1, 0, 2, 8, DC, DC), name: "counter-out", description: "Zaehlerstand Lieferg." },
    /* Easymeter Q3B */
    ObisAlias { id: Obis::new(1, 0, 1, 8, 1, DC), name: "esy-counter-t1", description: "Active Power Counter Tariff 1" },
    ObisAlias { id: Obis::new(1, 0, 1, 8, 2, DC), name: "esy-counter-t2", description: "Active Power Counter Tariff 2" },
    /* Hager eHz */
    ObisAlias { id: Obis::new(1, 0, 0, 0, 0, DC), name: "hag-id", description: "Eigentumsnr." },
    ObisAlias { id: Obis::new(1, 0, 96, 50, 0, 0), name: "hag-status", description: "Netz Status" },
    ObisAlias { id: Obis::new(1, 0, 96, 50, 0, 1), name: "hag-frequency", description: "Netz Periode" },
    ObisAlias { id: Obis::new(1, 0, 96, 50, 0, 2), name: "hag-temp", description: "aktuelle Chiptemperatur" },
    ObisAlias { id: Obis::new(1, 0, 96, 50, 0, 3), name: "hag-temp-min", description: "minimale Chiptemperatur" },
    ObisAlias { id: Obis::new(1, 0, 96, 50, 0, 4), name: "hag-temp-avg", description: "gemittelte Chiptemperatur" },
    ObisAlias { id: Obis::new(1, 0, 96, 50, 0, 5), name: "hag-temp-max", description: "maximale Chiptemperatur" },
    ObisAlias { id: Obis::new(1, 0, 96, 50, 0, 6), name: "hag-check", description: "Kontrollnr." },
    ObisAlias { id: Obis::new(1, 0, 96, 50, 0, 7), name: "hag-diag", description: "Diagnose" },
];
