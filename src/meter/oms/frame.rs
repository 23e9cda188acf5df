// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Single-byte positive acknowledgement.
pub const ACK: u8 = 0xe5;

const SHORT_START: u8 = 0x10;
const LONG_START: u8 = 0x68;
const STOP: u8 = 0x16;

/// Link-layer control masks (EN 13757-2).
pub mod control {
    /// "send normalise": reset the link.
    pub const SND_NKE: u8 = 0x40;
    /// "send user data".
    pub const SND_UD: u8 = 0x53;
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid start byte 0x{0:02x}")]
    BadStart(u8),
    #[error("length fields disagree ({0} != {1})")]
    LengthMismatch(u8, u8),
    #[error("length {0} too short for a long frame")]
    BadLength(u8),
    #[error("checksum mismatch (expected 0x{expected:02x}, got 0x{got:02x})")]
    Checksum { expected: u8, got: u8 },
    #[error("invalid stop byte 0x{0:02x}")]
    BadStop(u8),
}

/// One M-Bus link-layer frame, checksum already verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Short {
        control: u8,
        address: u8,
    },
    Long {
        control: u8,
        address: u8,
        control_information: u8,
        /// User data following the CI field.
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn control(&self) -> Option<u8> {
        match self {
            Frame::Ack => None,
            Frame::Short { control, .. } | Frame::Long { control, .. } => {
                Some(*control)
            },
        }
    }

    pub fn is_snd_ud(&self) -> bool {
        self.control()
            .is_some_and(|c| c & control::SND_UD == control::SND_UD)
    }

    pub fn is_snd_nke(&self) -> bool {
        self.control()
            .is_some_and(|c| c & control::SND_NKE == control::SND_NKE)
    }

    /// Serialises the frame including checksum and stop byte.
    pub fn pack(&self) -> Vec<u8> {
        match self {
            Frame::Ack => vec![ACK],
            Frame::Short { control, address } => {
                let cs = control.wrapping_add(*address);
                vec![SHORT_START, *control, *address, cs, STOP]
            },
            Frame::Long {
                control,
                address,
                control_information,
                payload,
            } => {
                let len = (payload.len() + 3) as u8;
                let mut out = Vec::with_capacity(payload.len() + 9);
                out.extend_from_slice(&[LONG_START, len, len, LONG_START]);
                out.push(*control);
                out.push(*address);
                out.push(*control_information);
                out.extend_from_slice(payload);
                let cs = checksum(&out[4..]);
                out.push(cs);
                out.push(STOP);
                out
            },
        }
    }

    /// Reads exactly one frame from the byte stream, verifying structure
    /// and checksum.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, FrameError> {
        let start = read_u8(r).await?;
        match start {
            ACK => Ok(Frame::Ack),

            SHORT_START => {
                let mut rest = [0u8; 4];
                r.read_exact(&mut rest).await?;
                let [control, address, cs, stop] = rest;
                let expected = control.wrapping_add(address);
                if cs != expected {
                    return Err(FrameError::Checksum { expected, got: cs });
                }
                if stop != STOP {
                    return Err(FrameError::BadStop(stop));
                }
                Ok(Frame::Short { control, address })
            },

            LONG_START => {
                let len1 = read_u8(r).await?;
                let len2 = read_u8(r).await?;
                if len1 != len2 {
                    return Err(FrameError::LengthMismatch(len1, len2));
                }
                if len1 < 3 {
                    return Err(FrameError::BadLength(len1));
                }
                let start2 = read_u8(r).await?;
                if start2 != LONG_START {
                    return Err(FrameError::BadStart(start2));
                }

                let mut body = vec![0u8; len1 as usize];
                r.read_exact(&mut body).await?;
                let cs = read_u8(r).await?;
                let stop = read_u8(r).await?;

                let expected = checksum(&body);
                if cs != expected {
                    return Err(FrameError::Checksum { expected, got: cs });
                }
                if stop != STOP {
                    return Err(FrameError::BadStop(stop));
                }

                Ok(Frame::Long {
                    control: body[0],
                    address: body[1],
                    control_information: body[2],
                    payload: body[3..].to_vec(),
                })
            },

            other => Err(FrameError::BadStart(other)),
        }
    }
}

/// Arithmetic checksum over control, address, CI and user data.
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

async fn read_u8<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8, FrameError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).await?;
    Ok(buf[0])
}
