use anyhow::Result;
use health_monitor::config::Config;
use health_monitor::grpc::{serve_uds, MonitorService};
use health_monitor::monitor::HealthMonitor;
use health_monitor::pipeline::PipelineHandle;
use health_monitor::store::{AlarmStore, MemoryAlarmStore, PgAlarmStore};
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,health_monitor=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "health-monitor"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn build_store(config: &Config) -> Result<Arc<dyn AlarmStore>> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("no database configured; alarms are kept in memory only");
        return Ok(Arc::new(MemoryAlarmStore::new()));
    };
    let store =
        PgAlarmStore::connect(database_url, config.db_pool_size, config.serializable).await?;
    if config.setup_database {
        store.ensure_schema().await?;
    }
    tracing::info!(
        pool_size = config.db_pool_size,
        serializable = config.serializable,
        "connected alarm store"
    );
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let sources = config.source_set()?;
    let store = build_store(&config).await?;
    let monitor = Arc::new(HealthMonitor::new(
        sources,
        config.monitor_settings(),
        store,
    ));
    tracing::info!(
        sources = monitor.sources().len(),
        detector = ?config.detector.kind,
        segment_policy = ?config.segment_policy,
        noisy_channel = %config.noisy_channel,
        "health monitor ready"
    );

    let pipeline = PipelineHandle::new(monitor.clone(), config.max_queue);
    let grpc_service = MonitorService::new(pipeline.clone());
    let grpc_path = config.grpc_socket_path.clone();
    let mut grpc_handle = tokio::spawn(async move { serve_uds(&grpc_path, grpc_service).await });

    tokio::select! {
        res = &mut grpc_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("gRPC server exited"),
                Ok(Err(err)) => tracing::error!(error=%err, "gRPC server failed"),
                Err(err) => tracing::error!(error=%err, "gRPC task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    grpc_handle.abort();
    pipeline.close().await;
    monitor.shutdown().await;
    if let Err(err) = tokio::fs::remove_file(&config.grpc_socket_path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error=%err, path = %config.grpc_socket_path, "failed to remove gRPC socket");
        }
    }

    Ok(())
}
