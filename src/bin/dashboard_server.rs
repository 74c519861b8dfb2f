use std::{net::SocketAddr, sync::Arc};

use aqh::{
    dashboard_router, init_logging, log_app_bind, log_app_start, log_source_selected,
    logging_config_from_env, pipeline_config_from_env, DashboardSnapshotSource,
    TableDirSnapshotSource,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("dashboard_server", &logging_cfg);

    let addr: SocketAddr = std::env::var("AQH_DASHBOARD_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let pipeline_cfg = pipeline_config_from_env();
    log_source_selected(
        "table_dir",
        Some(&pipeline_cfg.output_dir.display().to_string()),
    );
    let source: Arc<dyn DashboardSnapshotSource> =
        Arc::new(TableDirSnapshotSource::new(pipeline_cfg));

    let app = dashboard_router(source);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
