mod memory;
mod postgres;

pub use memory::MemoryAlarmStore;
pub use postgres::PgAlarmStore;

use crate::batch::{Channel, SourceId};
use crate::error::{MonitorError, StoreError};
use chrono::{DateTime, TimeDelta, Timelike, Utc};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alarm {
    pub timestamp_created: DateTime<Utc>,
    pub score: f64,
    pub segment_begin: DateTime<Utc>,
    pub segment_end: DateTime<Utc>,
    pub source_id: SourceId,
    pub channel: Channel,
}

impl Alarm {
    fn key(&self) -> AlarmKey {
        AlarmKey {
            source_id: self.source_id.clone(),
            channel: self.channel,
            segment_begin: self.segment_begin,
            segment_end: self.segment_end,
        }
    }

    fn duplicate_error(&self) -> StoreError {
        StoreError::DuplicateAlarm {
            source_id: self.source_id.clone(),
            channel: self.channel,
            segment_begin: self.segment_begin,
            segment_end: self.segment_end,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AlarmKey {
    source_id: SourceId,
    channel: Channel,
    segment_begin: DateTime<Utc>,
    segment_end: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct AlarmFilter {
    pub since: DateTime<Utc>,
    pub source_id: Option<SourceId>,
    pub channel: Option<Channel>,
}

impl AlarmFilter {
    pub fn matches(&self, alarm: &Alarm) -> bool {
        alarm.timestamp_created >= self.since
            && self
                .source_id
                .as_ref()
                .map(|source| *source == alarm.source_id)
                .unwrap_or(true)
            && self
                .channel
                .map(|channel| channel == alarm.channel)
                .unwrap_or(true)
    }
}

pub fn window_start(
    reference: DateTime<Utc>,
    window_seconds: i64,
) -> Result<DateTime<Utc>, MonitorError> {
    if window_seconds < 0 {
        return Err(MonitorError::InvalidQuery(format!(
            "window_seconds must not be negative, got {window_seconds}"
        )));
    }
    let truncated = reference.with_nanosecond(0).unwrap_or(reference);
    TimeDelta::try_seconds(window_seconds)
        .and_then(|window| truncated.checked_sub_signed(window))
        .ok_or_else(|| {
            MonitorError::InvalidQuery(format!("window_seconds {window_seconds} is out of range"))
        })
}

#[tonic::async_trait]
pub trait AlarmStore: Send + Sync {
    async fn insert(&self, alarm: &Alarm) -> Result<(), StoreError>;

    /// Alarms matching `filter`, ascending by `timestamp_created` then insertion order.
    async fn query(&self, filter: &AlarmFilter) -> Result<Vec<Alarm>, StoreError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_start_truncates_reference() {
        let reference = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap()
            + TimeDelta::milliseconds(750);
        let start = window_start(reference, 60).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 11, 59, 30).unwrap());
        let zero = window_start(reference, 0).unwrap();
        assert_eq!(zero, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap());
    }

    #[test]
    fn window_start_rejects_bad_windows() {
        assert!(matches!(
            window_start(Utc::now(), -1),
            Err(MonitorError::InvalidQuery(_))
        ));
        assert!(window_start(Utc::now(), i64::MAX).is_err());
    }

    #[test]
    fn filter_matches_optional_fields() {
        let now = Utc::now();
        let alarm = Alarm {
            timestamp_created: now,
            score: 4.0,
            segment_begin: now,
            segment_end: now,
            source_id: SourceId::parse("S1").unwrap(),
            channel: Channel::Ecg,
        };
        let mut filter = AlarmFilter {
            since: now - TimeDelta::seconds(1),
            source_id: None,
            channel: None,
        };
        assert!(filter.matches(&alarm));
        filter.channel = Some(Channel::O2);
        assert!(!filter.matches(&alarm));
        filter.channel = Some(Channel::Ecg);
        filter.source_id = Some(SourceId::parse("S2").unwrap());
        assert!(!filter.matches(&alarm));
        filter.source_id = None;
        filter.since = now + TimeDelta::seconds(1);
        assert!(!filter.matches(&alarm));
    }
}
