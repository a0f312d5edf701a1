use crate::batch::{Channel, SourceId};
use crate::detector::{AnomalyDetector, Detection, DetectorFactory};
use crate::error::MonitorError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type DetectorKey = (SourceId, Channel);

struct DetectorSlot {
    detector: Mutex<Box<dyn AnomalyDetector>>,
    invocations: AtomicU64,
}

#[derive(Clone)]
pub struct DetectorHandle {
    key: DetectorKey,
    slot: Arc<DetectorSlot>,
}

impl DetectorHandle {
    pub fn key(&self) -> &DetectorKey {
        &self.key
    }

    /// Advances the detector. Calls for the same key are serialized on the slot lock,
    /// so this blocks while another caller is mid-detection.
    pub fn detect(&self, values: &[f64]) -> Vec<Detection> {
        let mut detector = self
            .slot
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.slot.invocations.fetch_add(1, Ordering::Relaxed);
        detector.detect(values)
    }

    pub fn invocations(&self) -> u64 {
        self.slot.invocations.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("source", &self.key.0)
            .field("channel", &self.key.1)
            .field("invocations", &self.invocations())
            .finish()
    }
}

pub struct DetectorRegistry {
    factory: DetectorFactory,
    slots: Mutex<HashMap<DetectorKey, Arc<DetectorSlot>>>,
}

impl DetectorRegistry {
    pub fn new(factory: DetectorFactory) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DetectorKey, Arc<DetectorSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(in crate::monitor) fn provision(&self, source_id: &SourceId) -> usize {
        let mut slots = self.slots();
        let mut created = 0;
        for channel in Channel::ALL {
            slots
                .entry((source_id.clone(), channel))
                .or_insert_with(|| {
                    created += 1;
                    Arc::new(DetectorSlot {
                        detector: Mutex::new((self.factory)()),
                        invocations: AtomicU64::new(0),
                    })
                });
        }
        created
    }

    pub(in crate::monitor) fn release(&self, source_id: &SourceId) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|(source, _), _| source != source_id);
        before - slots.len()
    }

    pub fn get_detector(
        &self,
        source_id: &SourceId,
        channel: Channel,
    ) -> Result<DetectorHandle, MonitorError> {
        let key = (source_id.clone(), channel);
        let slot = self
            .slots()
            .get(&key)
            .cloned()
            .ok_or_else(|| MonitorError::UnknownSource(source_id.clone()))?;
        Ok(DetectorHandle { key, slot })
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{factory, DetectorKind, DetectorSettings};
    use std::thread;

    fn registry() -> DetectorRegistry {
        DetectorRegistry::new(factory(&DetectorSettings {
            kind: DetectorKind::Zscore,
            ..DetectorSettings::default()
        }))
    }

    #[test]
    fn provisions_one_detector_per_channel() {
        let registry = registry();
        let source = SourceId::parse("S1").unwrap();
        assert_eq!(registry.provision(&source), Channel::ALL.len());
        assert_eq!(registry.provision(&source), 0);
        assert_eq!(registry.len(), Channel::ALL.len());
        assert_eq!(registry.release(&source), Channel::ALL.len());
        assert!(registry.get_detector(&source, Channel::Ecg).is_err());
    }

    #[test]
    fn handles_share_state_between_calls() {
        let registry = registry();
        let source = SourceId::parse("S1").unwrap();
        registry.provision(&source);

        let first = registry.get_detector(&source, Channel::HeartRate).unwrap();
        first.detect(&[70.0, 71.0, 70.5, 70.8]);
        let again = registry.get_detector(&source, Channel::HeartRate).unwrap();
        assert!(!again.detect(&[150.0]).is_empty());
        assert_eq!(first.invocations(), 2);

        let other = registry.get_detector(&source, Channel::O2).unwrap();
        assert!(other.detect(&[150.0]).is_empty());
    }

    #[test]
    fn different_history_changes_the_result() {
        let registry = registry();
        let a = SourceId::parse("A").unwrap();
        let b = SourceId::parse("B").unwrap();
        registry.provision(&a);
        registry.provision(&b);

        let quiet = registry.get_detector(&a, Channel::Temperature).unwrap();
        let noisy = registry.get_detector(&b, Channel::Temperature).unwrap();
        quiet.detect(&[36.6, 36.7, 36.6, 36.5]);
        noisy.detect(&[30.0, 42.0, 33.0, 40.0]);

        let second = [39.5];
        assert_ne!(quiet.detect(&second).len(), noisy.detect(&second).len());
    }

    #[test]
    fn concurrent_calls_on_one_key_are_serialized() {
        let registry = Arc::new(registry());
        let source = SourceId::parse("S1").unwrap();
        registry.provision(&source);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let handle = registry.get_detector(&source, Channel::Airflow).unwrap();
                thread::spawn(move || {
                    for _ in 0..50 {
                        handle.detect(&[1.0, 2.0, 3.0]);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let handle = registry.get_detector(&source, Channel::Airflow).unwrap();
        assert_eq!(handle.invocations(), 400);
    }
}
