//! The ingestion, conditioning, detection and alarm pipeline for a set of sources.

mod aligner;
mod conditioner;
mod generator;
mod registry;
mod rolling;

pub use aligner::{align, frame, AlignedTable, FramedBatch};
pub use conditioner::{ConditionerSettings, SignalConditioner};
pub use generator::{AlarmGenerator, ChannelSkip, GenerateReport, SegmentPolicy, SkipReason};
pub use registry::{DetectorHandle, DetectorKey, DetectorRegistry};

use crate::batch::{Channel, SampleBatch, SourceId, SourceSet};
use crate::detector::{self, DetectorSettings};
use crate::error::{MonitorError, StoreError};
use crate::pipeline::MonitorStats;
use crate::store::{window_start, Alarm, AlarmFilter, AlarmStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct MonitorSettings {
    pub conditioner: ConditionerSettings,
    pub detector: DetectorSettings,
    pub segment_policy: SegmentPolicy,
    pub noisy_channel: Channel,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            conditioner: ConditionerSettings::default(),
            detector: DetectorSettings::default(),
            segment_policy: SegmentPolicy::default(),
            noisy_channel: Channel::Ecg,
        }
    }
}

/// Result of a lenient alarm lookup. A storage outage yields no alarms with
/// `storage_unavailable` set, so callers can tell it apart from an empty window.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AlarmPage {
    pub alarms: Vec<Alarm>,
    pub storage_unavailable: bool,
}

pub struct HealthMonitor {
    sources: RwLock<BTreeSet<SourceId>>,
    conditioner: Arc<SignalConditioner>,
    registry: Arc<DetectorRegistry>,
    generator: AlarmGenerator,
    store: Arc<dyn AlarmStore>,
    stats: Arc<MonitorStats>,
    noisy_channel: Channel,
    shut_down: AtomicBool,
}

impl HealthMonitor {
    pub fn new(sources: SourceSet, settings: MonitorSettings, store: Arc<dyn AlarmStore>) -> Self {
        let stats = Arc::new(MonitorStats::new());
        let registry = Arc::new(DetectorRegistry::new(detector::factory(&settings.detector)));
        let generator = AlarmGenerator::new(
            registry.clone(),
            store.clone(),
            settings.segment_policy,
            stats.clone(),
        );
        let monitor = Self {
            sources: RwLock::new(BTreeSet::new()),
            conditioner: Arc::new(SignalConditioner::new(settings.conditioner)),
            registry,
            generator,
            store,
            stats,
            noisy_channel: settings.noisy_channel,
            shut_down: AtomicBool::new(false),
        };
        for source_id in sources {
            monitor.register_source(source_id);
        }
        monitor
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    pub fn conditioner(&self) -> &SignalConditioner {
        &self.conditioner
    }

    pub fn noisy_channel(&self) -> Channel {
        self.noisy_channel
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, source_id: &SourceId) -> bool {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(source_id)
    }

    pub fn register_source(&self, source_id: SourceId) -> bool {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if sources.contains(&source_id) {
            tracing::debug!(source = %source_id, "source already registered");
            return false;
        }
        let detectors = self.registry.provision(&source_id);
        self.conditioner.provision(&source_id);
        tracing::info!(source = %source_id, detectors, "registered source");
        sources.insert(source_id);
        true
    }

    pub fn deregister_source(&self, source_id: &SourceId) -> bool {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if !sources.remove(source_id) {
            tracing::debug!(source = %source_id, "deregistering unknown source");
            return false;
        }
        let detectors = self.registry.release(source_id);
        self.conditioner.release(source_id);
        tracing::info!(source = %source_id, detectors, "deregistered source");
        true
    }

    pub async fn process_batch(&self, batch: SampleBatch) -> Result<GenerateReport, MonitorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MonitorError::ShutDown);
        }
        let started = Instant::now();
        let source_id = batch.source_id.clone();
        if !self.is_registered(&source_id) {
            tracing::warn!(source = %source_id, "batch for unregistered source");
            return Err(MonitorError::UnknownSource(source_id));
        }

        let mut framed = match aligner::frame(batch) {
            Ok(framed) => framed,
            Err(err) => {
                self.stats.record_malformed(err.to_string());
                return Err(err);
            }
        };

        if let Some(samples) = framed.column_mut(self.noisy_channel) {
            let raw = std::mem::take(samples);
            let conditioner = self.conditioner.clone();
            let source = source_id.clone();
            *samples =
                tokio::task::spawn_blocking(move || conditioner.condition(&source, &raw)).await??;
        }

        let table = aligner::align(&framed);
        let report = self.generator.generate(&source_id, &table).await?;
        self.stats.record_batch(started);
        if report.skipped.is_empty() {
            self.stats.clear_error();
        }
        tracing::debug!(
            source = %source_id,
            rows = table.len(),
            alarms = report.alarms.len(),
            skipped = report.skipped.len(),
            "processed batch"
        );
        Ok(report)
    }

    pub async fn query_alarms(
        &self,
        window_seconds: i64,
        source_id: Option<&SourceId>,
        channel: Option<Channel>,
    ) -> Result<Vec<Alarm>, MonitorError> {
        let filter = AlarmFilter {
            since: window_start(Utc::now(), window_seconds)?,
            source_id: source_id.cloned(),
            channel,
        };
        Ok(self.store.query(&filter).await?)
    }

    pub async fn get_alarms(
        &self,
        window_seconds: i64,
        source_id: Option<&SourceId>,
        channel: Option<Channel>,
    ) -> Result<AlarmPage, MonitorError> {
        match self.query_alarms(window_seconds, source_id, channel).await {
            Ok(alarms) => Ok(AlarmPage {
                alarms,
                storage_unavailable: false,
            }),
            Err(MonitorError::Store(err)) => {
                match &err {
                    StoreError::StorageUnavailable(reason) => {
                        tracing::warn!(window_seconds, error = %reason, "alarm query hit unavailable storage");
                    }
                    other => {
                        tracing::error!(window_seconds, error = %other, "alarm query failed");
                    }
                }
                self.stats.record_error(err.to_string());
                Ok(AlarmPage {
                    alarms: Vec::new(),
                    storage_unavailable: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("health monitor already shut down");
            return;
        }
        tracing::info!(sources = self.sources().len(), "shutting down health monitor");
        self.store.close().await;
        tracing::info!("health monitor shut down");
    }
}
