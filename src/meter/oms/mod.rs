// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, time::timeout};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, warn};

use crate::{
    cfg::config::MeterConfig,
    meter::{AsyncLink, MeterDriver},
    model::{
        obis::Obis,
        reading::{Reading, ReadingIdentifier},
    },
};

pub mod frame;
pub mod records;

use frame::{Frame, FrameError};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// How long one `read()` waits for the master to talk to us.
const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(30);

/// CI: 12-byte transport header followed by encrypted blocks.
const CI_TRANSPORT_LONG: u8 = 0x5b;

#[derive(Error, Debug)]
enum OmsError {
    #[error("payload too short for a transport header ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported CI 0x{0:02x}")]
    UnsupportedCi(u8),
    #[error("unsupported encryption mode {0}")]
    UnsupportedMode(u8),
    #[error("AES decryption failed")]
    Decrypt,
    #[error("encryption sanity check failed")]
    SanityCheck,
}

enum OmsLink {
    Serial(tokio_serial::SerialStream),
    Injected(Box<dyn AsyncLink>),
}

/// OMS (M-Bus) based meter support.
///
/// The local device is the slave: the physical side polls with SND_NKE /
/// SND_UD frames, we acknowledge with `E5h` and decode mode-5 encrypted
/// user data (AES-128-CBC with the dynamic per-telegram IV).
pub struct MeterOms {
    name: String,
    device: Option<String>,
    baudrate: u32,
    aes_key: [u8; 16],
    mbus_debug: bool,
    use_local_time: bool,
    frame_timeout: Duration,
    /// Telegram-level timestamp of the last decoded telegram; rebroadcast
    /// duplicates repeat it and are dropped wholesale.
    last_timestamp: f64,
    link: Option<OmsLink>,
}

impl MeterOms {
    pub fn from_config(cfg: &MeterConfig, name: &str) -> Result<Self> {
        let key_hex = cfg.key.as_deref().context("missing key")?;
        if key_hex.len() != 32 {
            bail!("key length needs to be 32");
        }
        let key_bytes = hex::decode(key_hex).context("key is not valid hex")?;
        let mut aes_key = [0u8; 16];
        aes_key.copy_from_slice(&key_bytes);

        Ok(Self {
            name: name.to_string(),
            device: Some(
                cfg.device
                    .clone()
                    .context("missing device")?,
            ),
            baudrate: cfg.baudrate.unwrap_or(9600),
            aes_key,
            mbus_debug: cfg.mbus_debug,
            use_local_time: cfg.use_local_time,
            frame_timeout: cfg
                .timeout
                .map_or(DEFAULT_FRAME_TIMEOUT, Duration::from_secs),
            last_timestamp: 0.0,
            link: None,
        })
    }

    /// Runs the slave over an externally provided transport.
    pub fn with_stream(name: &str, key: [u8; 16], stream: Box<dyn AsyncLink>) -> Self {
        Self {
            name: name.to_string(),
            device: None,
            baudrate: 9600,
            aes_key: key,
            mbus_debug: false,
            use_local_time: false,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            last_timestamp: 0.0,
            link: None,
        }
        .attach(stream)
    }

    fn attach(mut self, stream: Box<dyn AsyncLink>) -> Self {
        self.link = Some(OmsLink::Injected(stream));
        self
    }

    pub fn use_local_time(mut self, on: bool) -> Self {
        self.use_local_time = on;
        self
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let limit = self.frame_timeout;
        let link = match self.link.as_mut() {
            Some(l) => l,
            None => {
                return Err(FrameError::Io(std::io::Error::other("meter is not open")));
            },
        };
        let read = match link {
            OmsLink::Serial(s) => timeout(limit, Frame::read_from(s)).await,
            OmsLink::Injected(s) => timeout(limit, Frame::read_from(s)).await,
        };
        match read {
            Err(_elapsed) => Ok(None),
            Ok(Ok(frame)) => Ok(Some(frame)),
            // end of stream is a benign timeout for the slave loop
            Ok(Err(FrameError::Io(e)))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Ok(None)
            },
            Ok(Err(e)) => Err(e),
        }
    }

    async fn send_ack(&mut self) -> Result<()> {
        let bytes = Frame::Ack.pack();
        let link = self.link.as_mut().context("meter is not open")?;
        match link {
            OmsLink::Serial(s) => s.write_all(&bytes).await?,
            OmsLink::Injected(s) => s.write_all(&bytes).await?,
        }
        Ok(())
    }

    /// Decodes one SND_UD frame into readings. Crypto and structure
    /// problems drop the telegram and are reported to the caller for
    /// logging only.
    fn decode_user_data(&mut self, payload: &[u8], max: usize) -> Result<Vec<Reading>, OmsError> {
        if payload.len() < 12 {
            return Err(OmsError::TooShort(payload.len()));
        }

        // transport header: 4 ident, 2 manufacturer, version, medium,
        // access number, status, 2 configuration word
        let conf_low = payload[10];
        let conf_high = payload[11];
        debug!(
            meter = %self.name,
            control_word = format_args!("0x{conf_high:02x}{conf_low:02x}"),
            "transport header"
        );

        let mode = conf_high & 0x0f;
        if mode != 5 {
            return Err(OmsError::UnsupportedMode(mode));
        }
        let blocks = (conf_low >> 4) as usize;
        let encrypted = 12 + 16 * blocks;
        if payload.len() < encrypted {
            return Err(OmsError::TooShort(payload.len()));
        }

        // dynamic IV: manufacturer word, identification, version, medium,
        // then the access number repeated
        let mut iv = [0u8; 16];
        iv[0] = payload[4];
        iv[1] = payload[5];
        iv[2..6].copy_from_slice(&payload[0..4]);
        iv[6] = payload[6];
        iv[7] = payload[7];
        iv[8..].fill(payload[8]);

        let mut plain = payload[12..encrypted].to_vec();
        let dec = Aes128CbcDec::new_from_slices(&self.aes_key, &iv)
            .map_err(|_| OmsError::Decrypt)?;
        dec.decrypt_padded_mut::<NoPadding>(&mut plain)
            .map_err(|_| OmsError::Decrypt)?;

        if plain.len() < 2 || plain[0] != 0x2f || plain[1] != 0x2f {
            return Err(OmsError::SanityCheck);
        }
        debug!(meter = %self.name, blocks, "successfully decrypted a frame");
        if self.mbus_debug {
            debug!(meter = %self.name, plaintext = %hex::encode(&plain), "decrypted blocks");
        }

        let records = records::walk(&plain[2..]);
        debug!(meter = %self.name, count = records.len(), "data records");

        let mut telegram_time = 0.0;
        let mut readings = Vec::new();
        for record in &records {
            debug!(
                meter = %self.name,
                dif = format_args!("0x{:02x}", record.dif),
                vif = format_args!("0x{:02x}", record.vif),
                "record"
            );

            if record.vif_base() == 0x6d {
                let Some(t) = record.value() else { continue };
                if t > 1.0 && t == self.last_timestamp {
                    // duplicated timestamp from a rebroadcaster: the whole
                    // telegram is stale
                    debug!(
                        meter = %self.name,
                        timestamp = t,
                        "ignoring telegram due to duplicated timestamp"
                    );
                    return Ok(Vec::new());
                }
                if t > 1.0 {
                    self.last_timestamp = t;
                    telegram_time = t;
                }
                continue;
            }

            let obis = match (record.vif, record.dif, record.vife.first().copied()) {
                // active energy import total, Wh
                (0x03, 0x04, _) => Obis::new(0xff, 0xff, 1, 8, 0, 0xff),
                // active energy export total
                (0x83, 0x04, Some(0x3c)) => Obis::new(0xff, 0xff, 2, 8, 0, 0xff),
                // active power import
                (0x2b, 0x04, _) => Obis::new(0xff, 0xff, 1, 7, 0, 0xff),
                // active power export
                (0xab, 0x04, Some(0x3c)) => Obis::new(0xff, 0xff, 2, 7, 0, 0xff),
                _ => continue,
            };
            let Some(value) = record.value() else {
                continue;
            };

            if readings.len() < max {
                let time = if telegram_time > 1.0 && !self.use_local_time {
                    Reading::time_from_epoch_secs(telegram_time)
                } else {
                    chrono::Utc::now()
                };
                debug!(meter = %self.name, obis = %obis, value, "decoded reading");
                readings.push(Reading::new(value, time, ReadingIdentifier::Obis(obis)));
            }
        }

        Ok(readings)
    }
}

#[async_trait]
impl MeterDriver for MeterOms {
    async fn open(&mut self) -> Result<()> {
        if matches!(self.link, Some(OmsLink::Injected(_))) {
            return Ok(());
        }
        let device = self.device.clone().context("missing device")?;
        let stream = tokio_serial::new(&device, self.baudrate)
            .open_native_async()
            .with_context(|| format!("cannot open {device}"))?;
        self.link = Some(OmsLink::Serial(stream));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.link = None;
        Ok(())
    }

    async fn read(&mut self, out: &mut Vec<Reading>, max: usize) -> Result<usize> {
        out.clear();
        let mut got_snd_nke = false;

        loop {
            let frame = match self.recv_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(out.len()),
                Err(e) => {
                    debug!(meter = %self.name, error = %e, "dropping undecodable frame");
                    return Ok(out.len());
                },
            };
            debug!(meter = %self.name, ?frame, "got valid frame");

            if frame.is_snd_ud() {
                if !got_snd_nke {
                    warn!(meter = %self.name, "got SND_UD without SND_NKE");
                }
                if let Frame::Long {
                    control_information,
                    payload,
                    ..
                } = &frame
                {
                    if *control_information == CI_TRANSPORT_LONG {
                        match self.decode_user_data(payload, max - out.len()) {
                            Ok(readings) => out.extend(readings),
                            Err(e) => {
                                error!(meter = %self.name, error = %e, "telegram dropped");
                            },
                        }
                    } else {
                        debug!(
                            meter = %self.name,
                            error = %OmsError::UnsupportedCi(*control_information),
                            "telegram ignored"
                        );
                    }
                }
                self.send_ack().await.context("ack write failed")?;
            } else if frame.is_snd_nke() {
                got_snd_nke = true;
                self.send_ack().await.context("ack write failed")?;
            } else {
                debug!(
                    meter = %self.name,
                    "wrong frame received, waiting for SND_NKE or SND_UD"
                );
                return Ok(out.len());
            }
        }
    }

    /// OMS self-clocks; the interval option means nothing here.
    fn allow_interval(&self) -> bool {
        false
    }
}
