use std::fs;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use aqh::{
    dashboard_router, decompose_weekly, write_trend_table, CityDetail, CitySummaryRow,
    DashboardSnapshot, DashboardSnapshotSource, FilledSeries, InMemorySnapshotSource, PipelineConfig,
    TableDirSnapshotSource,
};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use chrono::NaiveDate;
use tower::util::ServiceExt;

fn snapshot() -> DashboardSnapshot {
    DashboardSnapshot {
        source_file: Some("data/openaq/openaq_pm25_IN_2025-02-05.csv".to_string()),
        national_mean_pm25: Some(62.4),
        cities: vec![
            CitySummaryRow::new("Delhi", 81.3, 700),
            CitySummaryRow::new("Bangalore", 34.9, 690),
        ],
    }
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn dashboard_page_renders_city_table() {
    let app = dashboard_router(Arc::new(InMemorySnapshotSource::new(snapshot())));
    let (status, text) = get(app, "/dashboard").await;

    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("<table id=\"city-table\""));
    assert!(text.contains("Mean PM2.5"));
    assert!(text.contains("href=\"/dashboard/cities/Delhi\""));
    assert!(text.contains("81.3"));
}

#[tokio::test]
async fn snapshot_endpoint_returns_json_rows_in_order() {
    let app = dashboard_router(Arc::new(InMemorySnapshotSource::new(snapshot())));
    let (status, text) = get(app, "/dashboard/snapshot").await;

    assert_eq!(status, StatusCode::OK);
    let parsed: DashboardSnapshot = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, snapshot());
}

#[tokio::test]
async fn city_route_returns_detail_or_not_found() {
    let source = InMemorySnapshotSource::new(snapshot()).with_city_detail(CityDetail {
        city: "Delhi".to_string(),
        trend: Vec::new(),
        forecast: Vec::new(),
    });
    let app = dashboard_router(Arc::new(source));

    let (status, text) = get(app.clone(), "/dashboard/cities/Delhi").await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("\"city\":\"Delhi\""));

    let (status, _) = get(app, "/dashboard/cities/Atlantis").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn table_dir_source_joins_input_means_with_written_trends() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        input_dir: dir.path().join("openaq"),
        output_dir: dir.path().join("tables"),
        ..PipelineConfig::default()
    };
    fs::create_dir_all(&cfg.input_dir).unwrap();
    fs::create_dir_all(&cfg.output_dir).unwrap();
    fs::write(
        cfg.input_dir.join("openaq_pm25_IN_2025-02-05.csv"),
        "city,value,timestamp\n\
         Delhi,90,2025-02-01 00:00:00\n\
         Delhi,70,2025-02-01 01:00:00\n\
         Pune,40,2025-02-01 00:00:00\n",
    )
    .unwrap();

    let values: Vec<f64> = (0..14).map(|d| 70.0 + d as f64).collect();
    let decomposition = decompose_weekly(&FilledSeries {
        entity: "Delhi".to_string(),
        start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        observed_days: values.len(),
        values,
        filled_ranges: Vec::new(),
    })
    .unwrap();
    write_trend_table(&cfg.output_dir, &decomposition).unwrap();

    let app = dashboard_router(Arc::new(TableDirSnapshotSource::new(cfg)));
    let (status, text) = get(app.clone(), "/dashboard/snapshot").await;
    assert_eq!(status, StatusCode::OK);

    let parsed: DashboardSnapshot = serde_json::from_str(&text).unwrap();
    assert!((parsed.national_mean_pm25.unwrap() - 200.0 / 3.0).abs() < 1e-9);
    assert_eq!(parsed.cities[0].city, "Delhi");
    assert_eq!(parsed.cities[0].mean_pm25, 80.0);
    assert!((parsed.cities[0].latest_trend.unwrap() - 80.0).abs() < 1e-9);
    assert_eq!(parsed.cities[1].latest_trend, None);

    let (status, _) = get(app.clone(), "/dashboard/cities/Delhi").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(app, "/dashboard/cities/Pune").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[derive(Default)]
struct ThreadRecordingSource {
    threads: Mutex<Vec<ThreadId>>,
}

impl ThreadRecordingSource {
    fn record(&self) {
        self.threads.lock().unwrap().push(thread::current().id());
    }
}

impl DashboardSnapshotSource for ThreadRecordingSource {
    fn snapshot(&self) -> DashboardSnapshot {
        self.record();
        snapshot()
    }

    fn city_detail(&self, _city: &str) -> Option<CityDetail> {
        self.record();
        None
    }
}

#[tokio::test]
async fn sources_are_read_off_the_request_thread() {
    let source = Arc::new(ThreadRecordingSource::default());
    let app = dashboard_router(source.clone());

    let (status, _) = get(app.clone(), "/dashboard").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(app.clone(), "/dashboard/snapshot").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(app, "/dashboard/cities/Delhi").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request_thread = thread::current().id();
    let threads = source.threads.lock().unwrap();
    assert_eq!(threads.len(), 3);
    assert!(threads.iter().all(|id| *id != request_thread));
}
