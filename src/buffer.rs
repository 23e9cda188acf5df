// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    fmt::Write as _,
    sync::{Mutex, MutexGuard},
};

use serde::Deserialize;

use crate::model::reading::Reading;

/// How readings inside one aggregation window collapse before upload.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggMode {
    #[serde(rename = "NONE", alias = "none")]
    #[default]
    None,
    #[serde(rename = "MAX", alias = "max")]
    Max,
    #[serde(rename = "AVG", alias = "avg")]
    Avg,
    #[serde(rename = "SUM", alias = "sum")]
    Sum,
}

#[derive(Debug, Default)]
struct Inner {
    readings: VecDeque<Reading>,
    new_values: bool,
    keep: usize,
}

/// Ordered queue of readings shared between one reader and one uploader.
///
/// The reader appends at the tail; the uploader flips delete markers on
/// existing entries. `clean` is the only operation removing entries and is
/// serialised by the same lock. The queue grows without a hard bound while
/// the middleware is unreachable; `keep` only limits what the local view
/// renders.
#[derive(Debug)]
pub struct Buffer {
    inner: Mutex<Inner>,
    aggmode: AggMode,
}

impl Buffer {
    /// Default count of most-recent readings kept visible to the local view.
    pub const DEFAULT_KEEP: usize = 32;

    pub fn new(aggmode: AggMode) -> Self {
        Self {
            inner: Mutex::new(Inner {
                readings: VecDeque::new(),
                new_values: false,
                keep: Self::DEFAULT_KEEP,
            }),
            aggmode,
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        // a poisoned lock only means a panicking reader; the queue itself
        // stays consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn aggmode(&self) -> AggMode {
        self.aggmode
    }

    pub fn keep(&self) -> usize {
        self.locked().keep
    }

    pub fn set_keep(&self, keep: usize) {
        self.locked().keep = keep;
    }

    pub fn len(&self) -> usize {
        self.locked().readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().readings.is_empty()
    }

    /// Appends at the tail and raises the new-values flag.
    pub fn push(&self, rd: Reading) {
        let mut inner = self.locked();
        inner.readings.push_back(rd);
        inner.new_values = true;
    }

    /// Returns the new-values flag, clearing it.
    pub fn take_new_values(&self) -> bool {
        let mut inner = self.locked();
        std::mem::take(&mut inner.new_values)
    }

    /// Collapses all non-deleted readings into exactly one survivor.
    ///
    /// The survivor is the latest reading by timestamp; its value becomes
    /// the max / mean / sum of the window. With `fixed_interval` the
    /// survivor's timestamp is snapped down to a multiple of `window_s`.
    /// Deleted entries stay in place until [`Buffer::clean`] runs.
    pub fn aggregate(&self, window_s: i64, fixed_interval: bool) {
        if self.aggmode == AggMode::None {
            return;
        }

        let mut inner = self.locked();
        let live: Vec<usize> = inner
            .readings
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.deleted())
            .map(|(i, _)| i)
            .collect();
        let Some(&first) = live.first() else {
            return;
        };

        let mut latest = first;
        let mut sum = 0.0;
        let mut max = f64::MIN;
        for &i in &live {
            let r = &inner.readings[i];
            if r.time() > inner.readings[latest].time() {
                latest = i;
            }
            sum += r.value();
            max = max.max(r.value());
        }

        let aggvalue = match self.aggmode {
            AggMode::Max => max,
            AggMode::Avg => sum / live.len() as f64,
            AggMode::Sum => sum,
            AggMode::None => unreachable!(),
        };

        for &i in &live {
            if i == latest {
                inner.readings[i].set_value(aggvalue);
            } else {
                inner.readings[i].mark_delete();
            }
        }

        if fixed_interval && window_s > 0 {
            let survivor = &mut inner.readings[latest];
            let snapped = window_s * (survivor.time().timestamp() / window_s);
            survivor.set_time(Reading::time_from_epoch_secs(snapped as f64));
        }
    }

    /// Physically drops entries carrying the delete marker.
    pub fn clean(&self) {
        self.locked().readings.retain(|r| !r.deleted());
    }

    /// Clears every delete marker, re-arming the entries for a resend.
    pub fn undelete(&self) {
        for r in self.locked().readings.iter_mut() {
            r.reset_delete();
        }
    }

    /// Failed-upload recovery: clears all delete markers, optionally
    /// removing the single oldest entry the middleware already stores
    /// (identified by its millisecond timestamp).
    pub fn requeue_failed(&self, drop_ts_ms: Option<i64>) {
        let mut inner = self.locked();
        if let Some(ts) = drop_ts_ms
            && let Some(pos) = inner.readings.iter().position(|r| r.time_ms() == ts)
        {
            let _ = inner.readings.remove(pos);
        }
        for r in inner.readings.iter_mut() {
            r.reset_delete();
        }
    }

    /// Copies the not-yet-acknowledged readings for an upload attempt.
    ///
    /// Every live entry is marked deleted; only those passing the
    /// monotonicity guard (strictly newer than `last_ts_ms`) end up in the
    /// returned list. The caller cleans on success or on an empty list, and
    /// undeletes after a failed POST.
    pub fn snapshot(&self, last_ts_ms: i64) -> Vec<Reading> {
        let mut inner = self.locked();
        let mut out = Vec::new();
        for r in inner.readings.iter_mut() {
            if r.deleted() {
                continue;
            }
            if r.time_ms() > last_ts_ms {
                out.push(r.clone());
            }
            r.mark_delete();
        }
        out
    }

    /// Most recent live readings for the local view, capped by the `keep`
    /// hint and `limit`.
    pub fn tail(&self, limit: usize) -> Vec<Reading> {
        let inner = self.locked();
        let n = limit.min(inner.keep);
        let live: Vec<Reading> = inner
            .readings
            .iter()
            .filter(|r| !r.deleted())
            .cloned()
            .collect();
        let skip = live.len().saturating_sub(n);
        live.into_iter().skip(skip).collect()
    }

    /// Pretty-prints the queued values as `{v1,v2,...}` into `out`.
    /// Returns `None` when the rendering would exceed `cap` bytes.
    pub fn dump(&self, out: &mut String, cap: usize) -> Option<()> {
        let inner = self.locked();
        out.clear();
        out.push('{');
        for (i, r) in inner.readings.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{:.4}", r.value());
            if out.len() >= cap {
                return None;
            }
        }
        out.push('}');
        (out.len() <= cap).then_some(())
    }

    /// Snapshot of the full queue, delete markers included. Debug helper.
    pub fn contents(&self) -> Vec<Reading> {
        self.locked().readings.iter().cloned().collect()
    }
}
