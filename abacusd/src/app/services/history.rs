// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::app::types::{JobId, JobStatusWithId};

pub const RECENTLY_COMPLETED_CAPACITY: usize = 20;

/// Fixed-capacity circular queue that overwrites its oldest entry when full.
///
/// Serializes as a plain sequence, oldest first, no matter where the write
/// cursor currently points.
#[derive(Clone, PartialEq, Eq)]
pub struct RingBuffer<T, const N: usize> {
    slots: Vec<Option<T>>,
    cursor: usize,
}

impl<T, const N: usize> RingBuffer<T, N> {
    pub fn new() -> Self {
        Self {
            slots: (0..N).map(|_| None).collect(),
            cursor: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn push(&mut self, item: T) {
        if N == 0 {
            return;
        }
        self.slots[self.cursor] = Some(item);
        self.cursor = (self.cursor + 1) % N;
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest to newest: one full lap starting at the cursor.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..N).filter_map(move |offset| self.slots[(self.cursor + offset) % N].as_ref())
    }
}

impl<T, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug, const N: usize> fmt::Debug for RingBuffer<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Serialize, const N: usize> Serialize for RingBuffer<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for item in self.iter() {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

struct RingVisitor<T, const N: usize>(PhantomData<T>);

impl<'de, T: Deserialize<'de>, const N: usize> Visitor<'de> for RingVisitor<T, N> {
    type Value = RingBuffer<T, N>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a sequence of at most {} entries, oldest first", N)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut ring = RingBuffer::new();
        while let Some(item) = seq.next_element()? {
            ring.push(item);
        }
        Ok(ring)
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for RingBuffer<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(RingVisitor(PhantomData))
    }
}

/// Per-owner view: jobs still in flight plus the last few that finished.
///
/// A job id lives in `active` or in `recently_completed`, never in both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerJobHistory {
    active: BTreeMap<JobId, JobStatusWithId>,
    recently_completed: RingBuffer<JobStatusWithId, RECENTLY_COMPLETED_CAPACITY>,
}

impl OwnerJobHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// PENDING/RUNNING overwrite the active entry; COMPLETE/FAILURE move the job
    /// into the completed ring. Terminal updates are appended every time they
    /// arrive, so a redelivered one shows up twice.
    pub fn apply(&mut self, update: JobStatusWithId) {
        if update.status.is_terminal() {
            self.active.remove(&update.job_id);
            self.recently_completed.push(update);
            return;
        }
        if self.recently_completed.iter().any(|done| done.job_id == update.job_id) {
            tracing::debug!(job_id = %update.job_id, status = update.status.as_str(), "ignoring update for a completed job");
            return;
        }
        self.active.insert(update.job_id.clone(), update);
    }

    pub fn active(&self) -> impl Iterator<Item = &JobStatusWithId> + '_ {
        self.active.values()
    }

    pub fn recently_completed(&self) -> impl Iterator<Item = &JobStatusWithId> + '_ {
        self.recently_completed.iter()
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.active.contains_key(job_id)
    }

    pub fn is_recently_completed(&self, job_id: &JobId) -> bool {
        self.recently_completed.iter().any(|done| &done.job_id == job_id)
    }
}
