// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{TimeZone, Utc};
use meterd_rs::{
    buffer::{AggMode, Buffer},
    model::reading::{Reading, ReadingIdentifier},
};

fn rd(value: f64, secs: i64) -> Reading {
    let t = Utc.timestamp_opt(secs, 0).single().expect("valid ts");
    Reading::new(value, t, ReadingIdentifier::Nil)
}

/// With aggregation NONE, clean() is a no-op and the surviving sequence
/// equals the input stream.
#[test]
fn none_mode_preserves_any_stream() {
    // a deterministic pseudo-random walk
    let mut x: u64 = 0x2545_f491_4f6c_dd1d;
    let mut stream = Vec::new();
    for i in 0..64 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        stream.push(((x % 10_000) as f64) / 100.0 + i as f64);
    }

    let buf = Buffer::new(AggMode::None);
    for (i, v) in stream.iter().enumerate() {
        buf.push(rd(*v, 1_000 + i as i64));
    }
    buf.aggregate(60, true);
    buf.clean();

    let survived: Vec<f64> = buf.contents().iter().map(Reading::value).collect();
    assert_eq!(survived, stream);
}

/// SUM/AVG/MAX leave exactly one survivor whose timestamp equals the
/// maximum input timestamp.
#[test]
fn window_modes_leave_single_latest_survivor() {
    let cases = [
        (AggMode::Max, 9.5),
        (AggMode::Avg, (1.0 + 9.5 + 4.5) / 3.0),
        (AggMode::Sum, 1.0 + 9.5 + 4.5),
    ];
    for (mode, expected) in cases {
        let buf = Buffer::new(mode);
        buf.push(rd(1.0, 100));
        buf.push(rd(9.5, 101));
        buf.push(rd(4.5, 103));

        let len_before = buf.len();
        buf.aggregate(0, false);
        assert_eq!(buf.len(), len_before, "aggregate must not remove entries");
        buf.clean();

        let left = buf.contents();
        assert_eq!(left.len(), 1, "{mode:?}");
        assert_eq!(left[0].value(), expected, "{mode:?}");
        assert_eq!(left[0].time_ms(), 103_000, "{mode:?}");
    }
}

#[test]
fn duplicate_recovery_shrinks_the_window() {
    let buf = Buffer::new(AggMode::Sum);
    buf.push(rd(100.0, 1));
    buf.push(rd(1.0, 2));
    buf.push(rd(2.0, 3));

    // middleware already stores the oldest entry: drop it, re-arm the rest
    let snap = buf.snapshot(0);
    assert_eq!(snap.len(), 3);
    buf.requeue_failed(Some(1_000));

    buf.aggregate(0, false);
    buf.clean();
    let left = buf.contents();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].value(), 3.0);
    assert_eq!(left[0].time_ms(), 3_000);
}

#[test]
fn undelete_then_clean_keeps_everything() {
    let buf = Buffer::new(AggMode::None);
    for i in 0..5 {
        buf.push(rd(i as f64, i));
    }
    let _ = buf.snapshot(0);
    buf.undelete();
    buf.clean();
    assert_eq!(buf.len(), 5);
}

#[test]
fn new_values_flag_tracks_pushes() {
    let buf = Buffer::new(AggMode::None);
    assert!(!buf.take_new_values());
    buf.push(rd(1.0, 1));
    buf.push(rd(2.0, 2));
    assert!(buf.take_new_values());
    assert!(!buf.take_new_values());
}
