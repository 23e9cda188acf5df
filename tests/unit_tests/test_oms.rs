// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use hex_literal::hex;
use meterd_rs::{
    meter::{
        MeterDriver,
        oms::{
            MeterOms,
            frame::{ACK, Frame, control},
        },
    },
    model::{obis::Obis, reading::ReadingIdentifier},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

const KEY: [u8; 16] = hex!("0078580E79544B145D1A96D0F7E777FA");

/// Builds a mode-5 SND_UD telegram around the given plaintext records.
fn encrypted_telegram(records: &[u8], access_no: u8) -> Vec<u8> {
    // identification, manufacturer, version, medium
    let mut payload = vec![0x78, 0x56, 0x34, 0x12, 0x93, 0x15, 0x33, 0x03];
    payload.push(access_no);
    payload.push(0x00); // status

    let mut plain = vec![0x2f, 0x2f];
    plain.extend_from_slice(records);
    while plain.len() % 16 != 0 {
        plain.push(0x2f); // AES filler
    }
    let blocks = plain.len() / 16;

    // configuration word: mode 5, block count in the high nibble
    payload.push((blocks as u8) << 4);
    payload.push(0x05);

    let mut iv = [0u8; 16];
    iv[0] = payload[4];
    iv[1] = payload[5];
    iv[2..6].copy_from_slice(&payload[0..4]);
    iv[6] = payload[6];
    iv[7] = payload[7];
    iv[8..].fill(access_no);

    let enc = Aes128CbcEnc::new_from_slices(&KEY, &iv).expect("key/iv sizes");
    let len = plain.len();
    enc.encrypt_padded_mut::<NoPadding>(&mut plain, len)
        .expect("block-aligned");

    payload.extend_from_slice(&plain);
    Frame::Long {
        control: control::SND_UD,
        address: 0xf0,
        control_information: 0x5b,
        payload,
    }
    .pack()
}

fn snd_nke() -> Vec<u8> {
    Frame::Short {
        control: control::SND_NKE,
        address: 0xf0,
    }
    .pack()
}

async fn run_slave(input: &[u8], key: [u8; 16]) -> Result<(Vec<meterd_rs::model::reading::Reading>, Vec<u8>)> {
    let (mut master, slave_side) = tokio::io::duplex(8192);
    let mut driver = MeterOms::with_stream("oms-test", key, Box::new(slave_side));
    driver.open().await?;

    master.write_all(input).await?;
    master.shutdown().await?;

    let mut readings = Vec::new();
    let n = driver.read(&mut readings, 32).await?;
    assert_eq!(n, readings.len());
    driver.close().await?;

    let mut acks = Vec::new();
    let _ = master.read_to_end(&mut acks).await?;
    Ok((readings, acks))
}

/// SND_NKE handshake plus one mode-5 telegram: both frames are ACKed with
/// `E5h` and the energy record comes out decrypted.
#[tokio::test]
async fn mode5_telegram_decrypts_to_energy_reading() -> Result<()> {
    // DIF 0x04 (32-bit int), VIF 0x03 (energy Wh), value 1234
    let mut input = snd_nke();
    input.extend_from_slice(&encrypted_telegram(&[0x04, 0x03, 0xd2, 0x04, 0x00, 0x00], 0x2a));

    let (readings, acks) = run_slave(&input, KEY).await?;

    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].value(), 1234.0);
    let expected = ReadingIdentifier::Obis(Obis::parse("1.8.0")?);
    assert_eq!(readings[0].identifier(), &expected);

    assert_eq!(acks, vec![ACK, ACK], "one ACK per received frame");
    Ok(())
}

/// Import and export records map onto their respective OBIS ids.
#[tokio::test]
async fn export_records_map_to_their_obis_ids() -> Result<()> {
    let records = [
        0x04, 0x03, 0x64, 0x00, 0x00, 0x00, // 1.8.0 = 100
        0x04, 0x83, 0x3c, 0x2c, 0x01, 0x00, 0x00, // 2.8.0 = 300
        0x04, 0x2b, 0xf4, 0x01, 0x00, 0x00, // 1.7.0 = 500
        0x04, 0xab, 0x3c, 0x58, 0x02, 0x00, 0x00, // 2.7.0 = 600
    ];
    let mut input = snd_nke();
    input.extend_from_slice(&encrypted_telegram(&records, 0x11));

    let (readings, _acks) = run_slave(&input, KEY).await?;
    let ids: Vec<String> = readings
        .iter()
        .map(|r| r.identifier().to_string())
        .collect();
    assert_eq!(readings.len(), 4, "got {ids:?}");
    assert_eq!(readings[0].value(), 100.0);
    assert_eq!(readings[1].value(), 300.0);
    assert_eq!(readings[2].value(), 500.0);
    assert_eq!(readings[3].value(), 600.0);

    let export = ReadingIdentifier::Obis(Obis::parse("2.8.0")?);
    assert_eq!(readings[1].identifier(), &export);
    Ok(())
}

/// A rebroadcast telegram with the same meter timestamp is discarded as a
/// whole.
#[tokio::test]
async fn duplicated_timestamp_drops_the_telegram() -> Result<()> {
    // CP32 time point 2023-11-14 13:37 plus one energy record
    let year = 23u8;
    let records = [
        0x04,
        0x6d,
        37,
        13,
        14 | ((year & 0x07) << 5),
        11 | ((year & 0x78) << 1),
        0x04,
        0x03,
        0x2a,
        0x00,
        0x00,
        0x00,
    ];

    let mut input = snd_nke();
    input.extend_from_slice(&encrypted_telegram(&records, 0x01));
    input.extend_from_slice(&encrypted_telegram(&records, 0x02));

    let (readings, acks) = run_slave(&input, KEY).await?;
    assert_eq!(readings.len(), 1, "second telegram is stale");
    assert_eq!(readings[0].value(), 42.0);
    // meter time is used as the reading timestamp
    assert_eq!(readings[0].time_ms() / 1000 % 60, 0);
    assert_eq!(acks.len(), 3, "stale telegrams are still ACKed");
    Ok(())
}

/// Decryption with the wrong key fails the 2F 2F sanity check; the frame is
/// dropped but still acknowledged.
#[tokio::test]
async fn wrong_key_drops_telegram_after_sanity_check() -> Result<()> {
    let mut input = snd_nke();
    input.extend_from_slice(&encrypted_telegram(&[0x04, 0x03, 0x01, 0x00, 0x00, 0x00], 0x07));

    let wrong_key = hex!("000102030405060708090a0b0c0d0e0f");
    let (readings, acks) = run_slave(&input, wrong_key).await?;
    assert!(readings.is_empty());
    assert_eq!(acks, vec![ACK, ACK]);
    Ok(())
}
