use crate::batch::{Channel, Sample, SampleBatch, SourceId};
use crate::error::MonitorError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

#[derive(Clone, Debug)]
pub struct FramedBatch {
    pub source_id: SourceId,
    pub columns: Vec<(Channel, Vec<Sample>)>,
}

impl FramedBatch {
    pub fn column_mut(&mut self, channel: Channel) -> Option<&mut Vec<Sample>> {
        self.columns
            .iter_mut()
            .find(|(candidate, _)| *candidate == channel)
            .map(|(_, samples)| samples)
    }
}

fn malformed(
    source_id: &SourceId,
    channel: &str,
    reason: impl Into<String>,
    payload: &[Sample],
) -> MonitorError {
    let reason = reason.into();
    tracing::error!(
        source = %source_id,
        channel,
        reason = %reason,
        payload = ?payload,
        "malformed batch; aborting"
    );
    MonitorError::MalformedBatch {
        source_id: source_id.clone(),
        channel: channel.to_string(),
        reason,
    }
}

// Unknown channel names are dropped; any other unframeable channel aborts the batch.
pub fn frame(batch: SampleBatch) -> Result<FramedBatch, MonitorError> {
    let SampleBatch { source_id, series } = batch;
    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(series.len());

    for entry in series {
        let channel = match entry.channel.parse::<Channel>() {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(
                    source = %source_id,
                    channel = %entry.channel,
                    error = %err,
                    payload = ?entry.samples,
                    "no detector for channel; dropping it"
                );
                continue;
            }
        };
        if !seen.insert(channel) {
            return Err(malformed(
                &source_id,
                &entry.channel,
                "channel appears more than once",
                &entry.samples,
            ));
        }
        if entry.samples.iter().any(|sample| sample.value.is_infinite()) {
            return Err(malformed(
                &source_id,
                &entry.channel,
                "infinite sample value",
                &entry.samples,
            ));
        }
        if entry.samples.is_empty() {
            continue;
        }
        columns.push((channel, entry.samples));
    }

    Ok(FramedBatch { source_id, columns })
}

/// Channel columns outer-joined on a shared, ascending timestamp index. Missing
/// cells are NaN. Repeated timestamps within a channel are kept in arrival order;
/// the n-th repeat of a timestamp in one channel shares a row with the n-th repeat
/// in another.
#[derive(Clone, Debug, Default)]
pub struct AlignedTable {
    index: Vec<DateTime<Utc>>,
    columns: BTreeMap<Channel, Vec<f64>>,
}

impl AlignedTable {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[DateTime<Utc>] {
        &self.index
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.columns.keys().copied()
    }

    pub fn column(&self, channel: Channel) -> Option<&[f64]> {
        self.columns.get(&channel).map(Vec::as_slice)
    }

    pub fn present(&self, channel: Channel) -> Vec<Sample> {
        let Some(column) = self.columns.get(&channel) else {
            return Vec::new();
        };
        self.index
            .iter()
            .zip(column.iter())
            .filter(|(_, value)| !value.is_nan())
            .map(|(timestamp, value)| Sample::new(*timestamp, *value))
            .collect()
    }
}

pub fn align(framed: &FramedBatch) -> AlignedTable {
    let mut rows: BTreeMap<(DateTime<Utc>, usize), Vec<(Channel, f64)>> = BTreeMap::new();
    for (channel, samples) in &framed.columns {
        let mut ordered: Vec<&Sample> = samples.iter().collect();
        ordered.sort_by_key(|sample| sample.timestamp);
        let mut repeats: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();
        for sample in ordered {
            let occurrence = repeats.entry(sample.timestamp).or_insert(0);
            rows.entry((sample.timestamp, *occurrence))
                .or_default()
                .push((*channel, sample.value));
            *occurrence += 1;
        }
    }

    let mut table = AlignedTable {
        index: Vec::with_capacity(rows.len()),
        columns: framed
            .columns
            .iter()
            .map(|(channel, _)| (*channel, Vec::with_capacity(rows.len())))
            .collect(),
    };
    for ((timestamp, _), cells) in rows {
        table.index.push(timestamp);
        for column in table.columns.values_mut() {
            column.push(f64::NAN);
        }
        for (channel, value) in cells {
            if let Some(column) = table.columns.get_mut(&channel) {
                if let Some(last) = column.last_mut() {
                    *last = value;
                }
            }
        }
    }
    table
}
