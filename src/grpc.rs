use crate::batch::{Channel, Sample, SampleBatch, SourceId};
use crate::error::MonitorError;
use crate::pipeline::{MonitorStats, PipelineHandle};
use crate::store::Alarm;
use anyhow::Result;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("health.monitor");
}

use proto::monitor_server::{Monitor, MonitorServer};
use proto::{
    Alarm as RpcAlarm, ChannelSeries as RpcSeries, HealthRequest, HealthResponse,
    PushBatchRequest, PushBatchResponse, QueryAlarmsRequest, QueryAlarmsResponse,
};

#[derive(Clone)]
pub struct MonitorService {
    pipeline: PipelineHandle,
}

impl MonitorService {
    pub fn new(pipeline: PipelineHandle) -> Self {
        Self { pipeline }
    }

    fn map_batch(source_id: &str, channels: Vec<RpcSeries>) -> Result<SampleBatch, Status> {
        let source_id = SourceId::parse(source_id).map_err(to_status)?;
        let mut batch = SampleBatch::new(source_id);
        for series in channels {
            let samples = series
                .samples
                .into_iter()
                .map(|sample| {
                    Sample::from_millis(sample.timestamp_ms, sample.value).ok_or_else(|| {
                        Status::invalid_argument(format!(
                            "invalid timestamp {} on channel {}",
                            sample.timestamp_ms, series.channel
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            batch = batch.with_channel(series.channel, samples);
        }
        Ok(batch)
    }

    fn map_alarm(alarm: Alarm) -> RpcAlarm {
        RpcAlarm {
            timestamp_created_ms: alarm.timestamp_created.timestamp_millis(),
            score: alarm.score,
            segment_begin_ms: alarm.segment_begin.timestamp_millis(),
            segment_end_ms: alarm.segment_end.timestamp_millis(),
            source_id: alarm.source_id.as_str().to_string(),
            channel: alarm.channel.as_str().to_string(),
        }
    }

    fn to_health(&self, stats: &Arc<MonitorStats>) -> HealthResponse {
        HealthResponse {
            queue_depth: stats.queue_depth.load(Ordering::Relaxed),
            batches_processed: stats.batches_processed.load(Ordering::Relaxed),
            malformed_batches: stats.malformed_batches.load(Ordering::Relaxed),
            alarms_committed: stats.alarms_committed.load(Ordering::Relaxed),
            duplicate_alarms: stats.duplicate_alarms.load(Ordering::Relaxed),
            storage_failures: stats.storage_failures.load(Ordering::Relaxed),
            last_batch_unix_ms: stats.last_batch_unix_ms.load(Ordering::Relaxed),
            average_batch_ms: stats.average_batch_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            last_error: stats.last_error().unwrap_or_default(),
            build: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn to_status(err: MonitorError) -> Status {
    match err {
        MonitorError::MalformedBatch { .. }
        | MonitorError::UnknownChannel(_)
        | MonitorError::InvalidSource(_)
        | MonitorError::InvalidQuery(_) => Status::invalid_argument(err.to_string()),
        MonitorError::UnknownSource(_) => Status::not_found(err.to_string()),
        MonitorError::ShutDown => Status::unavailable(err.to_string()),
        MonitorError::Store(_) => Status::unavailable(err.to_string()),
        MonitorError::Task(_) => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl Monitor for MonitorService {
    async fn push_batch(
        &self,
        request: Request<PushBatchRequest>,
    ) -> Result<Response<PushBatchResponse>, Status> {
        let payload = request.into_inner();
        let batch = Self::map_batch(&payload.source_id, payload.channels)?;

        let (alarms_committed, channels_skipped) = if payload.wait {
            let report = self.pipeline.submit(batch).await.map_err(to_status)?;
            (report.alarms.len() as u32, report.skipped.len() as u32)
        } else {
            self.pipeline.enqueue(batch).await.map_err(to_status)?;
            (0, 0)
        };

        let stats = self.pipeline.stats();
        Ok(Response::new(PushBatchResponse {
            queued: !payload.wait,
            alarms_committed,
            channels_skipped,
            queue_depth: stats.queue_depth.load(Ordering::Relaxed),
        }))
    }

    async fn query_alarms(
        &self,
        request: Request<QueryAlarmsRequest>,
    ) -> Result<Response<QueryAlarmsResponse>, Status> {
        let payload = request.into_inner();
        let source_id = Some(payload.source_id.as_str())
            .filter(|raw| !raw.is_empty())
            .map(SourceId::parse)
            .transpose()
            .map_err(to_status)?;
        let channel = Some(payload.channel.as_str())
            .filter(|raw| !raw.is_empty())
            .map(str::parse::<Channel>)
            .transpose()
            .map_err(to_status)?;

        let page = self
            .pipeline
            .monitor()
            .get_alarms(payload.window_seconds, source_id.as_ref(), channel)
            .await
            .map_err(to_status)?;

        Ok(Response::new(QueryAlarmsResponse {
            alarms: page.alarms.into_iter().map(Self::map_alarm).collect(),
            storage_unavailable: page.storage_unavailable,
        }))
    }

    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let stats = self.pipeline.stats();
        Ok(Response::new(self.to_health(&stats)))
    }

    async fn flush(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        self.pipeline.flush().await.map_err(to_status)?;
        let stats = self.pipeline.stats();
        Ok(Response::new(self.to_health(&stats)))
    }
}

async fn remove_stale_socket(socket_path: &str) -> std::io::Result<()> {
    if !Path::new(socket_path).exists() {
        return Ok(());
    }
    match tokio::fs::remove_file(socket_path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            tracing::warn!(error = %err, socket_path, "failed to remove stale gRPC socket");
            Err(err)
        }
        _ => Ok(()),
    }
}

pub async fn serve_uds(socket_path: &str, service: MonitorService) -> Result<()> {
    // A failed removal surfaces again as the bind error below.
    let _ = remove_stale_socket(socket_path).await;

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<MonitorServer<MonitorService>>()
        .await;

    let incoming = UnixListenerStream::new(uds);
    tracing::info!(socket_path, "gRPC monitor listening");

    Server::builder()
        .add_service(health_service)
        .add_service(MonitorServer::new(service))
        .serve_with_incoming(incoming)
        .await?;

    Ok(())
}
