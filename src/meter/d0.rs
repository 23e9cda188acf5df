// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_serial::{DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, error, warn};

use crate::{
    cfg::{
        config::{MeterConfig, decode_hex_seq},
        enums::ParityMode,
    },
    meter::{AsyncLink, MeterDriver},
    model::{
        obis::Obis,
        reading::{Reading, ReadingIdentifier},
    },
};

/// Bytes scanned for the sync pattern before giving up.
const SYNC_SCAN_LIMIT: usize = 1024;
/// Inter-character timeout, the serial VTIME equivalent.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

const STX: u8 = 0x02;

#[derive(Debug, Clone)]
enum Endpoint {
    Serial { path: String, parity: ParityMode },
    Tcp { addr: String },
    /// Transport was handed in from outside; open() keeps it as is.
    Injected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AckSeq {
    None,
    Bytes(Vec<u8>),
    /// `06 30 <speed> 30 0D 0A` derived from the data-phase baud rate.
    Auto,
}

enum Link {
    Serial(SerialStream),
    Tcp(TcpStream),
    Injected(Box<dyn AsyncLink>),
}

impl Link {
    /// Reads a single byte. `Ok(None)` covers both the inter-character
    /// timeout and end of stream; the caller abandons the telegram either
    /// way.
    async fn read_byte(&mut self, limit: Duration) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let read = match self {
            Link::Serial(s) => timeout(limit, s.read(&mut buf)).await,
            Link::Tcp(s) => timeout(limit, s.read(&mut buf)).await,
            Link::Injected(s) => timeout(limit, s.read(&mut buf)).await,
        };
        match read {
            Err(_elapsed) => Ok(None),
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(buf[0])),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Link::Serial(s) => s.write_all(data).await?,
            Link::Tcp(s) => s.write_all(data).await?,
            Link::Injected(s) => s.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Link::Serial(s) => s.flush().await?,
            Link::Tcp(s) => s.flush().await?,
            Link::Injected(s) => s.flush().await?,
        }
        Ok(())
    }

    /// Line-speed change for the two-speed data phase; only meaningful on a
    /// real serial line.
    fn set_baud(&mut self, baud: u32) -> Result<()> {
        if let Link::Serial(s) = self {
            s.set_baud_rate(baud).context("failed to switch baud rate")?;
        }
        Ok(())
    }
}

/// Telegram parser contexts; see the pull/ack handshake in the IEC
/// 62056-21 mode C exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    Start,
    Vendor,
    Baudrate,
    Identification,
    Ack,
    ObisCode,
    Value,
    Unit,
    EndLine,
    End,
}

/// Plaintext protocol according to DIN EN 62056-21 over an IR optical head
/// or RS-232, serial or TCP.
///
/// Readings are identified by OBIS codes extracted from `CODE(VALUE[*UNIT])`
/// lines. Only codes starting with `1`, `2` or `C` are emitted; the rest of
/// a telegram is discarded on purpose.
pub struct MeterD0 {
    name: String,
    endpoint: Endpoint,
    link: Option<Link>,
    baudrate: u32,
    baudrate_read: u32,
    pull: Vec<u8>,
    ack: AckSeq,
    wait_sync_end: bool,
    read_timeout: Duration,
}

impl MeterD0 {
    pub fn from_config(cfg: &MeterConfig, name: &str) -> Result<Self> {
        let endpoint = match (&cfg.device, &cfg.host) {
            (Some(path), _) => Endpoint::Serial {
                path: path.clone(),
                parity: cfg.parity.unwrap_or_default(),
            },
            (None, Some(host)) => Endpoint::Tcp { addr: host.clone() },
            (None, None) => bail!("missing device or host"),
        };

        let baudrate = cfg.baudrate.unwrap_or(9600);
        let baudrate_read = cfg.baudrate_read.unwrap_or(baudrate);

        let pull = match &cfg.pullseq {
            Some(seq) => decode_hex_seq(seq)?,
            None => Vec::new(),
        };
        let ack = match cfg.ackseq.as_deref() {
            None => AckSeq::None,
            Some("auto") => {
                // make sure the data-phase baud has a speed digit
                let _ = speed_char(baudrate_read)?;
                AckSeq::Auto
            },
            Some(seq) => AckSeq::Bytes(decode_hex_seq(seq)?),
        };

        Ok(Self {
            name: name.to_string(),
            endpoint,
            link: None,
            baudrate,
            baudrate_read,
            pull,
            ack,
            wait_sync_end: cfg.wait_sync.as_deref() == Some("end"),
            read_timeout: cfg
                .timeout
                .map_or(DEFAULT_READ_TIMEOUT, Duration::from_secs),
        })
    }

    /// Runs the parser over an externally provided transport.
    pub fn with_stream(name: &str, stream: Box<dyn AsyncLink>) -> Self {
        Self {
            name: name.to_string(),
            endpoint: Endpoint::Injected,
            link: Some(Link::Injected(stream)),
            baudrate: 9600,
            baudrate_read: 9600,
            pull: Vec::new(),
            ack: AckSeq::None,
            wait_sync_end: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn wait_sync_end(mut self, on: bool) -> Self {
        self.wait_sync_end = on;
        self
    }

    fn link(&mut self) -> Result<&mut Link> {
        self.link.as_mut().context("meter is not open")
    }

    /// Discards input until the first `!`, aligning to a telegram boundary.
    /// Meters that start sending on their own need this once after open.
    async fn sync_to_telegram_end(&mut self) -> Result<bool> {
        let limit = self.read_timeout;
        let mut skipped = 0usize;
        loop {
            match self.link()?.read_byte(limit).await? {
                None => return Ok(false),
                Some(b'!') => {
                    debug!(meter = %self.name, skipped, "found telegram boundary");
                    self.wait_sync_end = false;
                    return Ok(true);
                },
                Some(_) => {
                    skipped += 1;
                    if skipped > SYNC_SCAN_LIMIT {
                        error!(
                            meter = %self.name,
                            skipped, "gave up searching for telegram boundary"
                        );
                        self.wait_sync_end = false;
                        return Ok(true);
                    }
                },
            }
        }
    }

    /// Writes the ack sequence and switches to the data-phase baud rate
    /// once the write has drained.
    async fn send_ack(&mut self) -> Result<()> {
        let bytes = match &self.ack {
            AckSeq::None => return Ok(()),
            AckSeq::Bytes(b) => b.clone(),
            AckSeq::Auto => vec![0x06, 0x30, speed_char(self.baudrate_read)?, 0x30, 0x0d, 0x0a],
        };

        let two_speed = self.baudrate_read != self.baudrate;
        let baud = self.baudrate_read;
        let name = self.name.clone();
        let link = self.link()?;
        link.write_all(&bytes).await?;
        link.flush().await?;
        debug!(meter = %name, len = bytes.len(), "ack sequence sent");
        if two_speed {
            link.set_baud(baud)?;
            debug!(meter = %name, baud, "switched to data-phase baud rate");
        }
        Ok(())
    }
}

#[async_trait]
impl MeterDriver for MeterD0 {
    async fn open(&mut self) -> Result<()> {
        match &self.endpoint {
            Endpoint::Serial { path, parity } => {
                let (data_bits, parity_bit) = match parity {
                    ParityMode::EightN1 => (DataBits::Eight, Parity::None),
                    ParityMode::SevenN1 => (DataBits::Seven, Parity::None),
                    ParityMode::SevenE1 => (DataBits::Seven, Parity::Even),
                    ParityMode::SevenO1 => (DataBits::Seven, Parity::Odd),
                };
                let stream = tokio_serial::new(path, self.baudrate)
                    .data_bits(data_bits)
                    .parity(parity_bit)
                    .stop_bits(StopBits::One)
                    .open_native_async()
                    .with_context(|| format!("cannot open {path}"))?;
                self.link = Some(Link::Serial(stream));
            },
            Endpoint::Tcp { addr } => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("cannot connect to {addr}"))?;
                self.link = Some(Link::Tcp(stream));
            },
            Endpoint::Injected => {
                // the stream came from outside, nothing to acquire
            },
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // dropping the stream restores the previous line discipline
        self.link = None;
        Ok(())
    }

    async fn read(&mut self, out: &mut Vec<Reading>, max: usize) -> Result<usize> {
        out.clear();

        if !self.pull.is_empty() {
            let pull = self.pull.clone();
            let name = self.name.clone();
            let link = self.link()?;
            link.write_all(&pull).await?;
            link.flush().await?;
            debug!(meter = %name, len = pull.len(), "pull sequence sent");
        }

        if self.wait_sync_end && !self.sync_to_telegram_end().await? {
            return Ok(0);
        }

        let mut ctx = Ctx::Start;
        let mut vendor: Vec<u8> = Vec::with_capacity(3);
        let mut identification: Vec<u8> = Vec::with_capacity(16);
        let mut obis_code: Vec<u8> = Vec::with_capacity(16);
        let mut value: Vec<u8> = Vec::with_capacity(32);
        let mut unit: Vec<u8> = Vec::with_capacity(16);
        let mut endseq: Vec<u8> = Vec::with_capacity(2);
        let mut baudrate_id = 0u8;
        let mut last_byte = 0u8;

        let limit = self.read_timeout;
        loop {
            let Some(byte) = self.link()?.read_byte(limit).await? else {
                warn!(
                    meter = %self.name,
                    ?ctx,
                    last_byte,
                    "read timed out, abandoning telegram"
                );
                out.clear();
                return Ok(0);
            };
            last_byte = byte;

            // "!" terminates the telegram, "?!" re-runs the pull handshake
            if byte == b'?' || byte == b'!' {
                if ctx != Ctx::End {
                    endseq.clear();
                }
                ctx = Ctx::End;
            }

            match ctx {
                Ctx::Start => {
                    // allow extra newlines, strip the initial "/"
                    if byte != b'\r' && byte != b'\n' {
                        vendor.clear();
                        ctx = Ctx::Vendor;
                    }
                },

                Ctx::Vendor => {
                    if byte == b'\r' || byte == b'\n' || byte == b'/' {
                        vendor.clear();
                        continue;
                    }
                    if !byte.is_ascii_alphanumeric() {
                        error!(meter = %self.name, byte, "vendor id must be alphanumeric");
                        return Ok(0);
                    }
                    vendor.push(byte);
                    if vendor.len() >= 3 {
                        ctx = Ctx::Baudrate;
                    }
                },

                Ctx::Baudrate => {
                    baudrate_id = byte;
                    identification.clear();
                    ctx = Ctx::Identification;
                },

                Ctx::Identification => {
                    if byte == b'\r' || byte == b'\n' {
                        debug!(
                            meter = %self.name,
                            vendor = %String::from_utf8_lossy(&vendor),
                            baudrate = %(baudrate_id as char),
                            identification = %String::from_utf8_lossy(&identification),
                            "identification received"
                        );
                        self.send_ack().await?;
                        ctx = Ctx::Ack;
                    } else if !byte.is_ascii_graphic() && byte != b' ' {
                        error!(meter = %self.name, byte, "binary byte in identification");
                        return Ok(0);
                    } else if identification.len() < 16 {
                        identification.push(byte);
                    }
                },

                Ctx::Ack => {
                    // swallows the line feed following the banner
                    obis_code.clear();
                    ctx = Ctx::ObisCode;
                },

                Ctx::ObisCode => {
                    if byte == b'\r' || byte == b'\n' || byte == STX {
                        continue;
                    }
                    if byte == b'(' {
                        value.clear();
                        ctx = Ctx::Value;
                    } else if obis_code.len() < 16 {
                        obis_code.push(byte);
                    }
                },

                Ctx::Value => {
                    if byte == b'*' {
                        unit.clear();
                        ctx = Ctx::Unit;
                    } else if byte == b')' {
                        unit.clear();
                        ctx = Ctx::EndLine;
                    } else if value.len() < 32 {
                        value.push(byte);
                    }
                },

                Ctx::Unit => {
                    if byte == b')' {
                        ctx = Ctx::EndLine;
                    } else if unit.len() < 16 {
                        unit.push(byte);
                    }
                },

                Ctx::EndLine => {
                    // historical "(...)" groups before the newline are dropped
                    if byte == b'\r' || byte == b'\n' {
                        if out.len() < max && !obis_code.is_empty() && !value.is_empty() {
                            self.finish_line(&obis_code, &value, &unit, out);
                        }
                        obis_code.clear();
                        ctx = Ctx::ObisCode;
                    }
                },

                Ctx::End => {
                    endseq.push(byte);
                    if endseq[0] == b'?' {
                        if endseq.len() >= 2 {
                            if endseq[1] == b'!' {
                                // the meter replayed the pull sequence
                                debug!(meter = %self.name, "pull echo seen, resync to vendor");
                                vendor.clear();
                                ctx = Ctx::Vendor;
                            } else {
                                endseq.clear();
                            }
                        }
                        continue;
                    }
                    debug!(
                        meter = %self.name,
                        tuples = out.len(),
                        vendor = %String::from_utf8_lossy(&vendor),
                        identification = %String::from_utf8_lossy(&identification),
                        "telegram complete"
                    );
                    return Ok(out.len());
                },
            }
        }
    }

    fn allow_interval(&self) -> bool {
        true
    }
}

impl MeterD0 {
    /// Turns a finished `CODE(VALUE[*UNIT])` line into a reading.
    ///
    /// Only OBIS codes starting with `1`, `2` or `C` (electricity and
    /// abstract groups) are emitted. An unparsable code drops the line.
    fn finish_line(
        &self,
        obis_code: &[u8],
        value: &[u8],
        unit: &[u8],
        out: &mut Vec<Reading>,
    ) {
        if !matches!(obis_code[0], b'1' | b'2' | b'C') {
            return;
        }

        let code = String::from_utf8_lossy(obis_code);
        let val = parse_leading_f64(&String::from_utf8_lossy(value));
        debug!(
            meter = %self.name,
            code = %code,
            value = val,
            unit = %String::from_utf8_lossy(unit),
            "parsed reading"
        );

        match Obis::parse(&code) {
            Ok(obis) => {
                out.push(Reading::now(val, ReadingIdentifier::Obis(obis)));
            },
            Err(e) => {
                warn!(meter = %self.name, code = %code, error = %e, "dropping line");
            },
        }
    }
}

/// IEC 62056-21 speed digit for the mode C baud switch: 300 Bd times two to
/// the digit.
fn speed_char(baud: u32) -> Result<u8> {
    Ok(match baud {
        300 => b'0',
        600 => b'1',
        1200 => b'2',
        2400 => b'3',
        4800 => b'4',
        9600 => b'5',
        19200 => b'6',
        _ => bail!("baud rate {baud} has no mode C speed digit"),
    })
}

/// `strtod` semantics: parse the longest leading float, 0.0 when there is
/// none. Meters pad values with spaces and stray characters.
fn parse_leading_f64(s: &str) -> f64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;

    while end < bytes.len() {
        let b = bytes[end];
        match b {
            b'0'..=b'9' => seen_digit = true,
            b'+' | b'-' if end == 0 => {},
            b'+' | b'-' if seen_exp && matches!(bytes[end - 1], b'e' | b'E') => {},
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }

    // an exponent marker without digits after it is not part of the number
    while end > 0 && matches!(bytes[end - 1], b'e' | b'E' | b'+' | b'-' | b'.') {
        if bytes[end - 1] == b'.' && seen_digit {
            break;
        }
        end -= 1;
    }

    s[..end].parse().unwrap_or(0.0)
}
