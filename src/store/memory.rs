use super::{Alarm, AlarmFilter, AlarmKey, AlarmStore};
use crate::error::StoreError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<Alarm>,
    keys: HashSet<AlarmKey>,
}

#[derive(Debug, Default)]
pub struct MemoryAlarmStore {
    state: Mutex<MemoryState>,
    closed: AtomicBool,
    #[cfg(test)]
    outage: AtomicBool,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::StorageUnavailable("store is closed".to_string()));
        }
        if self.simulated_outage() {
            return Err(StoreError::StorageUnavailable(
                "simulated outage".to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    fn simulated_outage(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn simulated_outage(&self) -> bool {
        false
    }
}

#[tonic::async_trait]
impl AlarmStore for MemoryAlarmStore {
    async fn insert(&self, alarm: &Alarm) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        if !state.keys.insert(alarm.key()) {
            return Err(alarm.duplicate_error());
        }
        state.rows.push(alarm.clone());
        Ok(())
    }

    async fn query(&self, filter: &AlarmFilter) -> Result<Vec<Alarm>, StoreError> {
        self.check_available()?;
        let state = self.lock();
        let mut rows: Vec<Alarm> = state
            .rows
            .iter()
            .filter(|alarm| filter.matches(alarm))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        rows.sort_by_key(|alarm| alarm.timestamp_created);
        Ok(rows)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("memory alarm store already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Channel, SourceId};
    use crate::store::window_start;
    use chrono::{TimeDelta, Utc};

    fn alarm(source: &str, channel: Channel, offset_secs: i64) -> Alarm {
        let now = Utc::now();
        Alarm {
            timestamp_created: now,
            score: 5.0,
            segment_begin: now - TimeDelta::seconds(10 + offset_secs),
            segment_end: now - TimeDelta::seconds(offset_secs),
            source_id: SourceId::parse(source).unwrap(),
            channel,
        }
    }

    fn everything() -> AlarmFilter {
        AlarmFilter {
            since: Utc::now() - TimeDelta::hours(1),
            source_id: None,
            channel: None,
        }
    }

    #[tokio::test]
    async fn duplicate_insert_keeps_one_row() {
        let store = MemoryAlarmStore::new();
        let first = alarm("S1", Channel::Ecg, 0);
        store.insert(&first).await.unwrap();
        let err = store.insert(&first).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAlarm { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn same_segment_on_other_channel_is_not_duplicate() {
        let store = MemoryAlarmStore::new();
        let ecg = alarm("S1", Channel::Ecg, 0);
        let mut o2 = ecg.clone();
        o2.channel = Channel::O2;
        store.insert(&ecg).await.unwrap();
        store.insert(&o2).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn query_orders_by_creation_then_insertion() {
        let store = MemoryAlarmStore::new();
        let mut a = alarm("S1", Channel::Ecg, 0);
        let mut b = alarm("S1", Channel::O2, 1);
        let mut c = alarm("S2", Channel::Ecg, 2);
        let ts = Utc::now();
        a.timestamp_created = ts;
        b.timestamp_created = ts;
        c.timestamp_created = ts - TimeDelta::seconds(5);
        for item in [&a, &b, &c] {
            store.insert(item).await.unwrap();
        }
        let rows = store.query(&everything()).await.unwrap();
        assert_eq!(rows, vec![c.clone(), a.clone(), b.clone()]);

        let mut filter = everything();
        filter.source_id = Some(SourceId::parse("S1").unwrap());
        filter.channel = Some(Channel::O2);
        assert_eq!(store.query(&filter).await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn recent_alarm_is_inside_minute_window_but_not_zero_window_later() {
        let store = MemoryAlarmStore::new();
        let created = alarm("S1", Channel::Ecg, 0);
        store.insert(&created).await.unwrap();

        let filter = AlarmFilter {
            since: window_start(Utc::now(), 60).unwrap(),
            source_id: None,
            channel: None,
        };
        assert_eq!(store.query(&filter).await.unwrap().len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let filter = AlarmFilter {
            since: window_start(Utc::now(), 0).unwrap(),
            source_id: None,
            channel: None,
        };
        assert!(store.query(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outage_and_close_report_unavailable() {
        let store = MemoryAlarmStore::new();
        store.set_outage(true);
        assert!(matches!(
            store.query(&everything()).await,
            Err(StoreError::StorageUnavailable(_))
        ));
        store.set_outage(false);
        store.close().await;
        store.close().await;
        assert!(matches!(
            store.insert(&alarm("S1", Channel::Ecg, 0)).await,
            Err(StoreError::StorageUnavailable(_))
        ));
    }
}
