//! Entity timelines and the race-group fold.
//!
//! Base records are sorted once by [`SortKey`]; after that a timeline is just
//! the ascending list of record indices that share a partition key. Entries
//! with the same `(race_date, race_id)` form a race group. [`fold_timeline`]
//! reads every member of a group before committing any of them, which is the
//! only way partition state is allowed to advance.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::participation::RaceParticipation;
use crate::pipeline::BaseRecord;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub race_date: NaiveDate,
    pub race_id: String,
    /// Missing saddle-cloth numbers sort after every real one.
    pub horse_number: u32,
    pub horse_id: String,
    pub ordinal: u64,
}

impl SortKey {
    pub fn for_participation(participation: &RaceParticipation, ordinal: u64) -> Self {
        Self {
            race_date: participation.race_date,
            race_id: participation.race_id.clone(),
            horse_number: participation.horse_number.unwrap_or(u32::MAX),
            horse_id: participation.horse_id.clone(),
            ordinal,
        }
    }

    pub fn same_race_group(&self, other: &SortKey) -> bool {
        self.race_date == other.race_date && self.race_id == other.race_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTimeline {
    pub key: String,
    pub entries: Vec<usize>,
}

/// Groups record indices by partition key. Records must already be sorted,
/// so every timeline comes out in ascending order. Records for which
/// `key_of` returns `None` belong to no timeline.
pub fn build_timelines<F>(records: &[BaseRecord], key_of: F) -> Vec<EntityTimeline>
where
    F: Fn(&BaseRecord) -> Option<String>,
{
    let mut grouped: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        if let Some(key) = key_of(record) {
            grouped.entry(key).or_default().push(idx);
        }
    }
    grouped
        .into_iter()
        .map(|(key, entries)| EntityTimeline { key, entries })
        .collect()
}

/// Splits a sorted run of indices into race-group spans.
pub fn race_group_spans(records: &[BaseRecord], entries: &[usize]) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    while start < entries.len() {
        let head = &records[entries[start]].key;
        let mut end = start + 1;
        while end < entries.len() && records[entries[end]].key.same_race_group(head) {
            end += 1;
        }
        spans.push(start..end);
        start = end;
    }
    spans
}

/// Walks one timeline. Each group member gets `read` against the state as it
/// stood before the group, then the group's finishers are committed.
pub fn fold_timeline<S, O, R, C>(
    records: &[BaseRecord],
    entries: &[usize],
    state: &mut S,
    read: R,
    commit: C,
) -> Vec<(usize, O)>
where
    R: Fn(&S, &BaseRecord) -> O,
    C: Fn(&mut S, &BaseRecord),
{
    let mut out = Vec::with_capacity(entries.len());
    for span in race_group_spans(records, entries) {
        let group = &entries[span];
        for idx in group {
            out.push((*idx, read(state, &records[*idx])));
        }
        for idx in group.iter().filter(|idx| records[**idx].finished) {
            commit(state, &records[*idx]);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderViolation {
    pub index: usize,
    pub previous: SortKey,
    pub current: SortKey,
}

pub fn verify_sorted(records: &[BaseRecord]) -> Result<(), OrderViolation> {
    for (index, pair) in records.windows(2).enumerate() {
        if pair[0].key >= pair[1].key {
            return Err(OrderViolation {
                index: index + 1,
                previous: pair[0].key.clone(),
                current: pair[1].key.clone(),
            });
        }
    }
    Ok(())
}
