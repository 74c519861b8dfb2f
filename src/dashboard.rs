//! City summary table and per-city result routes over the pipeline outputs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{self, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::decompose::TrendRow;
use crate::forecast::{ForecastRow, FORECAST_HORIZON_DAYS};
use crate::measurements::{city_mean_table, read_measurements_csv, LoadError};
use crate::writer::{forecast_table_path, read_forecast_table, read_trend_table, trend_table_path};

pub const DASHBOARD_HEADERS: [&str; 7] = [
    "City",
    "Mean PM2.5",
    "Measurements",
    "Latest Trend",
    "Forecast Mean (30d)",
    "Horizon Lower",
    "Horizon Upper",
];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub source_file: Option<String>,
    pub national_mean_pm25: Option<f64>,
    pub cities: Vec<CitySummaryRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitySummaryRow {
    pub city: String,
    pub mean_pm25: f64,
    pub measurements: usize,
    pub latest_trend: Option<f64>,
    pub forecast_mean_next_30d: Option<f64>,
    pub horizon_yhat_lower: Option<f64>,
    pub horizon_yhat_upper: Option<f64>,
}

impl CitySummaryRow {
    pub fn new(city: impl Into<String>, mean_pm25: f64, measurements: usize) -> Self {
        Self {
            city: city.into(),
            mean_pm25,
            measurements,
            latest_trend: None,
            forecast_mean_next_30d: None,
            horizon_yhat_lower: None,
            horizon_yhat_upper: None,
        }
    }

    pub fn to_cell_text_values(&self) -> Vec<String> {
        vec![
            self.city.clone(),
            format!("{:.1}", self.mean_pm25),
            self.measurements.to_string(),
            display_or_dash(self.latest_trend),
            display_or_dash(self.forecast_mean_next_30d),
            display_or_dash(self.horizon_yhat_lower),
            display_or_dash(self.horizon_yhat_upper),
        ]
    }

    /// Fills the result columns from whichever tables exist.
    pub fn with_results(mut self, trend: &[TrendRow], forecast: &[ForecastRow]) -> Self {
        self.latest_trend = trend.last().map(|row| row.trend);
        let future = &forecast[forecast.len().saturating_sub(FORECAST_HORIZON_DAYS)..];
        if !future.is_empty() {
            self.forecast_mean_next_30d =
                Some(future.iter().map(|row| row.yhat).sum::<f64>() / future.len() as f64);
        }
        if let Some(last) = forecast.last() {
            self.horizon_yhat_lower = Some(last.yhat_lower);
            self.horizon_yhat_upper = Some(last.yhat_upper);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityDetail {
    pub city: String,
    pub trend: Vec<TrendRow>,
    pub forecast: Vec<ForecastRow>,
}

pub trait DashboardSnapshotSource: Send + Sync + 'static {
    fn snapshot(&self) -> DashboardSnapshot;
    fn city_detail(&self, city: &str) -> Option<CityDetail>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotSource {
    snapshot: DashboardSnapshot,
    details: BTreeMap<String, CityDetail>,
}

impl InMemorySnapshotSource {
    pub fn new(snapshot: DashboardSnapshot) -> Self {
        Self {
            snapshot,
            details: BTreeMap::new(),
        }
    }

    pub fn with_city_detail(mut self, detail: CityDetail) -> Self {
        self.details.insert(detail.city.clone(), detail);
        self
    }
}

impl DashboardSnapshotSource for InMemorySnapshotSource {
    fn snapshot(&self) -> DashboardSnapshot {
        self.snapshot.clone()
    }

    fn city_detail(&self, city: &str) -> Option<CityDetail> {
        self.details.get(city).cloned()
    }
}

/// Re-reads the latest input file and the output tables on every request,
/// so a fresh pipeline run shows up without a restart.
#[derive(Debug, Clone)]
pub struct TableDirSnapshotSource {
    config: PipelineConfig,
}

impl TableDirSnapshotSource {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

impl DashboardSnapshotSource for TableDirSnapshotSource {
    fn snapshot(&self) -> DashboardSnapshot {
        let input = match self.config.selector.select_latest(&self.config.input_dir) {
            Ok(input) => input,
            Err(err) => {
                warn!(
                    component = "dashboard",
                    event = "dashboard.snapshot.scan_failed",
                    dir = %self.config.input_dir.display(),
                    error = %err
                );
                None
            }
        };
        let Some(input) = input else {
            return DashboardSnapshot::default();
        };

        match snapshot_from_tables(&input, &self.config.output_dir) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    component = "dashboard",
                    event = "dashboard.snapshot.load_failed",
                    path = %input.display(),
                    error = %err
                );
                DashboardSnapshot {
                    source_file: Some(input.display().to_string()),
                    ..DashboardSnapshot::default()
                }
            }
        }
    }

    fn city_detail(&self, city: &str) -> Option<CityDetail> {
        let (trend, forecast) = read_city_tables(&self.config.output_dir, city);
        if trend.is_none() && forecast.is_none() {
            return None;
        }
        Some(CityDetail {
            city: city.to_string(),
            trend: trend.unwrap_or_default(),
            forecast: forecast.unwrap_or_default(),
        })
    }
}

/// Summary rows in descending mean order, joined with any result tables
/// found under `output_dir`.
pub fn snapshot_from_tables(input: &Path, output_dir: &Path) -> Result<DashboardSnapshot, LoadError> {
    let measurements = read_measurements_csv(input)?;
    let national_mean_pm25 = (!measurements.is_empty()).then(|| {
        measurements.iter().map(|m| m.value).sum::<f64>() / measurements.len() as f64
    });

    let cities = city_mean_table(&measurements)
        .into_iter()
        .map(|mean| {
            let (trend, forecast) = read_city_tables(output_dir, &mean.city);
            CitySummaryRow::new(mean.city, mean.mean_value, mean.measurements).with_results(
                trend.as_deref().unwrap_or_default(),
                forecast.as_deref().unwrap_or_default(),
            )
        })
        .collect();

    Ok(DashboardSnapshot {
        source_file: Some(input.display().to_string()),
        national_mean_pm25,
        cities,
    })
}

fn read_city_tables(
    output_dir: &Path,
    city: &str,
) -> (Option<Vec<TrendRow>>, Option<Vec<ForecastRow>>) {
    let trend_path = trend_table_path(output_dir, city);
    let forecast_path = forecast_table_path(output_dir, city);

    let trend = trend_path
        .exists()
        .then(|| read_trend_table(&trend_path))
        .and_then(|result| {
            result
                .map_err(|err| {
                    debug!(
                        component = "dashboard",
                        event = "dashboard.table.unreadable",
                        path = %trend_path.display(),
                        error = %err
                    )
                })
                .ok()
        });
    let forecast = forecast_path
        .exists()
        .then(|| read_forecast_table(&forecast_path))
        .and_then(|result| {
            result
                .map_err(|err| {
                    debug!(
                        component = "dashboard",
                        event = "dashboard.table.unreadable",
                        path = %forecast_path.display(),
                        error = %err
                    )
                })
                .ok()
        });
    (trend, forecast)
}

pub fn dashboard_router(source: Arc<dyn DashboardSnapshotSource>) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/dashboard/snapshot", get(get_dashboard_snapshot))
        .route("/dashboard/cities/{city}", get(get_city_detail))
        .with_state(DashboardAppState { source })
}

pub fn render_dashboard_html(snapshot: &DashboardSnapshot) -> String {
    let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>Air Quality Dashboard</title>\n");
    out.push_str("<style>:root{--bg:#eef3ef;--card:#ffffff;--ink:#1b2421;--muted:#5d6b66;--line:#d5ddd9;--head:#1f4a3d}*{box-sizing:border-box}body{margin:0;color:var(--ink);font-family:\"Avenir Next\",\"Segoe UI\",sans-serif;background:linear-gradient(160deg,var(--bg),#e4edf2);min-height:100vh}.shell{max-width:1200px;margin:0 auto;padding:24px 18px 28px}.hero{background:linear-gradient(135deg,#163a30 0%,#2d6a57 100%);color:#f4faf7;border-radius:16px;padding:18px 20px}.hero h1{margin:0 0 8px;font-size:1.6rem}.hero-meta{display:flex;gap:16px;flex-wrap:wrap;font-size:.92rem;color:#d7ebe3}.card{margin-top:16px;background:var(--card);border:1px solid #c9d4cf;border-radius:16px;overflow:hidden}.table-wrap{overflow:auto;max-height:75vh}table{width:100%;border-collapse:collapse}thead th{position:sticky;top:0;background:var(--head);color:#f2f8f5;font-size:.8rem;text-transform:uppercase;letter-spacing:.04em;padding:10px}tbody td{font-size:.86rem;padding:9px 10px;border-bottom:1px solid var(--line);white-space:nowrap}tbody tr:nth-child(even){background:#f9fbfa}.city-link{color:#1f4a3d;font-weight:700;text-decoration:none}.legend{padding:10px 14px;border-top:1px solid var(--line);font-size:.8rem;color:var(--muted)}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<section class=\"hero\"><h1>Air Quality Dashboard</h1>");
    out.push_str("<div class=\"hero-meta\">\n");
    out.push_str(&format!(
        "<span>Source: {}</span>",
        escape_html(snapshot.source_file.as_deref().unwrap_or("-"))
    ));
    out.push_str(&format!(
        "<span>National mean PM2.5: {}</span>",
        display_or_dash(snapshot.national_mean_pm25)
    ));
    out.push_str(&format!("<span>Cities: {}</span>", snapshot.cities.len()));
    out.push_str(&format!(
        "<span>Generated: {}</span>",
        escape_html(&now_utc)
    ));
    out.push_str("</div></section>\n");
    out.push_str("<section class=\"card\"><div class=\"table-wrap\"><table id=\"city-table\">\n");
    out.push_str("<thead><tr>");
    for header in DASHBOARD_HEADERS {
        out.push_str("<th>");
        out.push_str(&escape_html(header));
        out.push_str("</th>");
    }
    out.push_str("</tr></thead><tbody>\n");

    for (idx, row) in snapshot.cities.iter().enumerate() {
        let values = row.to_cell_text_values();
        out.push_str(&format!("<tr data-row=\"{idx}\">"));
        out.push_str("<td><a class=\"city-link\" href=\"/dashboard/cities/");
        out.push_str(&escape_html(&url_path_segment(&row.city)));
        out.push_str("\">");
        out.push_str(&escape_html(&values[0]));
        out.push_str("</a></td>");
        for value in values.iter().skip(1) {
            out.push_str("<td>");
            out.push_str(&escape_html(value));
            out.push_str("</td>");
        }
        out.push_str("</tr>\n");
    }

    out.push_str("</tbody></table></div><div class=\"legend\">Values in µg/m³. Forecast columns cover the 30 days after the last observation; <b>-</b> marks cities without result tables.</div></section>");
    out.push_str("</main></body></html>\n");
    out
}

fn display_or_dash(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.1}"))
        .unwrap_or_else(|| "-".to_string())
}

fn url_path_segment(input: &str) -> String {
    input.replace('%', "%25").replace(' ', "%20").replace('/', "%2F")
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn DashboardSnapshotSource>,
}

/// Sources may read files, so they run on the blocking pool rather than on
/// a runtime worker.
async fn read_source<T, F>(state: &DashboardAppState, read: F) -> Result<T, Response>
where
    F: FnOnce(&dyn DashboardSnapshotSource) -> T + Send + 'static,
    T: Send + 'static,
{
    let source = Arc::clone(&state.source);
    tokio::task::spawn_blocking(move || read(source.as_ref()))
        .await
        .map_err(|err| {
            warn!(
                component = "dashboard",
                event = "dashboard.source.failed",
                error = %err
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

async fn get_dashboard_html(State(state): State<DashboardAppState>) -> Response {
    let snapshot = match read_source(&state, |source| source.snapshot()).await {
        Ok(snapshot) => snapshot,
        Err(response) => return response,
    };
    info!(
        component = "dashboard",
        event = "http.dashboard.request",
        cities = snapshot.cities.len()
    );
    Html(render_dashboard_html(&snapshot)).into_response()
}

async fn get_dashboard_snapshot(State(state): State<DashboardAppState>) -> Response {
    let snapshot = match read_source(&state, |source| source.snapshot()).await {
        Ok(snapshot) => snapshot,
        Err(response) => return response,
    };
    info!(
        component = "dashboard",
        event = "http.snapshot.request",
        cities = snapshot.cities.len()
    );
    Json(snapshot).into_response()
}

async fn get_city_detail(
    State(state): State<DashboardAppState>,
    extract::Path(city): extract::Path<String>,
) -> Response {
    let lookup = city.clone();
    let detail = match read_source(&state, move |source| source.city_detail(&lookup)).await {
        Ok(detail) => detail,
        Err(response) => return response,
    };
    info!(
        component = "dashboard",
        event = "http.city.request",
        city = %city,
        found = detail.is_some()
    );
    match detail {
        Some(detail) => Json(detail).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no result tables", "city": city })),
        )
            .into_response(),
    }
}
