use super::aligner::AlignedTable;
use super::registry::DetectorRegistry;
use crate::batch::{Channel, Sample, SourceId};
use crate::detector::Detection;
use crate::error::{MonitorError, StoreError};
use crate::pipeline::MonitorStats;
use crate::store::{Alarm, AlarmStore};
use chrono::{SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentPolicy {
    #[default]
    FirstSegment,
    AllSegments,
}

impl std::str::FromStr for SegmentPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "first" | "first_segment" => Ok(Self::FirstSegment),
            "all" | "all_segments" => Ok(Self::AllSegments),
            other => Err(format!("unknown segment policy {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    StorageUnavailable,
    StorageFailure(String),
    DetectorFailure(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Duplicate => f.write_str("duplicate alarm"),
            SkipReason::StorageUnavailable => f.write_str("storage unavailable"),
            SkipReason::StorageFailure(reason) => write!(f, "storage failure: {reason}"),
            SkipReason::DetectorFailure(reason) => write!(f, "detector failure: {reason}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSkip {
    pub channel: Channel,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, Default)]
pub struct GenerateReport {
    pub alarms: Vec<Alarm>,
    pub skipped: Vec<ChannelSkip>,
}

pub struct AlarmGenerator {
    registry: Arc<DetectorRegistry>,
    store: Arc<dyn AlarmStore>,
    policy: SegmentPolicy,
    stats: Arc<MonitorStats>,
}

impl AlarmGenerator {
    pub fn new(
        registry: Arc<DetectorRegistry>,
        store: Arc<dyn AlarmStore>,
        policy: SegmentPolicy,
        stats: Arc<MonitorStats>,
    ) -> Self {
        Self {
            registry,
            store,
            policy,
            stats,
        }
    }

    pub fn policy(&self) -> SegmentPolicy {
        self.policy
    }

    pub async fn generate(
        &self,
        source_id: &SourceId,
        table: &AlignedTable,
    ) -> Result<GenerateReport, MonitorError> {
        let mut report = GenerateReport::default();
        for channel in table.channels() {
            let series = table.present(channel);
            let (Some(first), Some(last)) = (series.first(), series.last()) else {
                tracing::debug!(source = %source_id, %channel, "no samples after dropping gaps; skipping");
                continue;
            };
            tracing::debug!(
                source = %source_id,
                %channel,
                samples = series.len(),
                candidate_begin = %first.timestamp,
                candidate_end = %last.timestamp,
                "running detector"
            );

            let handle = self.registry.get_detector(source_id, channel)?;
            let values: Vec<f64> = series.iter().map(|sample| sample.value).collect();
            let detections = match tokio::task::spawn_blocking(move || handle.detect(&values)).await {
                Ok(detections) => detections,
                Err(err) => {
                    tracing::error!(source = %source_id, %channel, error = %err, "detector task failed");
                    self.stats.record_error(format!("detector {source_id}/{channel}: {err}"));
                    report.skipped.push(ChannelSkip {
                        channel,
                        reason: SkipReason::DetectorFailure(err.to_string()),
                    });
                    continue;
                }
            };

            let selected: &[Detection] = match self.policy {
                SegmentPolicy::FirstSegment => &detections[..detections.len().min(1)],
                SegmentPolicy::AllSegments => &detections,
            };
            if detections.len() > selected.len() {
                tracing::debug!(
                    source = %source_id,
                    %channel,
                    reported = detections.len(),
                    "surfacing only the highest-scoring segment"
                );
            }

            for detection in selected {
                let Some(alarm) = to_alarm(source_id, channel, &series, detection) else {
                    tracing::error!(
                        source = %source_id,
                        %channel,
                        begin = detection.begin,
                        end = detection.end,
                        samples = series.len(),
                        "detector reported a segment outside its input"
                    );
                    report.skipped.push(ChannelSkip {
                        channel,
                        reason: SkipReason::DetectorFailure("segment out of range".to_string()),
                    });
                    continue;
                };
                match self.store.insert(&alarm).await {
                    Ok(()) => {
                        self.stats.record_alarm();
                        tracing::info!(
                            source = %source_id,
                            %channel,
                            score = alarm.score,
                            segment_begin = %alarm.segment_begin,
                            segment_end = %alarm.segment_end,
                            "alarm committed"
                        );
                        report.alarms.push(alarm);
                    }
                    Err(err) => {
                        let reason = self.classify(source_id, channel, &alarm, err);
                        report.skipped.push(ChannelSkip { channel, reason });
                    }
                }
            }
        }
        Ok(report)
    }

    fn classify(
        &self,
        source_id: &SourceId,
        channel: Channel,
        alarm: &Alarm,
        err: StoreError,
    ) -> SkipReason {
        match err {
            StoreError::DuplicateAlarm { .. } => {
                self.stats.record_duplicate();
                tracing::warn!(
                    source = %source_id,
                    %channel,
                    segment_begin = %alarm.segment_begin,
                    segment_end = %alarm.segment_end,
                    "duplicate alarm; skipping"
                );
                SkipReason::Duplicate
            }
            StoreError::StorageUnavailable(reason) => {
                self.stats.record_storage_failure(&reason);
                tracing::warn!(
                    source = %source_id,
                    %channel,
                    error = %reason,
                    alarm = ?alarm,
                    "alarm storage unavailable; alarm not committed"
                );
                SkipReason::StorageUnavailable
            }
            StoreError::Backend(reason) => {
                self.stats.record_storage_failure(&reason);
                tracing::error!(
                    source = %source_id,
                    %channel,
                    error = %reason,
                    alarm = ?alarm,
                    "alarm commit failed"
                );
                SkipReason::StorageFailure(reason)
            }
        }
    }
}

fn to_alarm(
    source_id: &SourceId,
    channel: Channel,
    series: &[Sample],
    detection: &Detection,
) -> Option<Alarm> {
    let begin = series.get(detection.begin)?;
    let end = series.get(detection.end)?;
    // Stored timestamps hold microseconds; truncate so in-memory and stored keys agree.
    Some(Alarm {
        timestamp_created: Utc::now().trunc_subsecs(6),
        score: detection.score,
        segment_begin: begin.timestamp.min(end.timestamp).trunc_subsecs(6),
        segment_end: begin.timestamp.max(end.timestamp).trunc_subsecs(6),
        source_id: source_id.clone(),
        channel,
    })
}
