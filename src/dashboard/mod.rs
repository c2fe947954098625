//! Read-only web dashboard
//!
//! - `/` live project/sandbox overview
//! - `/api/projects` aggregate status of every live project
//! - `/api/summary` turn and sandbox counters
//! - `/metrics` Prometheus text format

use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::metrics;
use crate::project::SessionRegistry;

/// Dashboard application state
#[derive(Clone)]
pub struct DashboardState {
    pub registry: Arc<SessionRegistry>,
}

/// Counters shown on the dashboard page
#[derive(Serialize)]
pub struct Summary {
    pub live_projects: f64,
    pub live_listeners: f64,
    pub turns_succeeded: f64,
    pub turns_failed: f64,
    pub avg_turn_duration_ms: f64,
}

pub fn create_router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(dashboard_page))
        .route("/api/projects", get(project_statuses))
        .route("/api/summary", get(summary))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

async fn dashboard_page() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn project_statuses(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.registry.statuses().await)
}

async fn summary() -> impl IntoResponse {
    let turns = |outcome: &str| {
        metrics::TURNS
            .get_metric_with_label_values(&[outcome])
            .map(|m| m.get())
            .unwrap_or(0.0)
    };

    let count = metrics::TURN_DURATION.get_sample_count();
    let avg_turn_duration_ms = if count > 0 {
        (metrics::TURN_DURATION.get_sample_sum() / count as f64) * 1000.0
    } else {
        0.0
    };

    Json(Summary {
        live_projects: metrics::LIVE_PROJECT_MANAGERS.get(),
        live_listeners: metrics::LIVE_LISTENERS.get(),
        turns_succeeded: turns("success"),
        turns_failed: turns("error") + turns("timeout") + turns("rejected"),
        avg_turn_duration_ms,
    })
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

const DASHBOARD_HTML: &str = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Sparkvisor</title>
    <style>
        body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background: #101014; color: #ddd; padding: 2rem; }
        h1 { color: #ffb347; }
        .card { background: #1b1b22; border: 1px solid #333; border-radius: 10px; padding: 1rem 1.5rem; margin-bottom: 1rem; }
        .row { display: flex; justify-content: space-between; padding: 0.3rem 0; border-bottom: 1px solid #26262e; }
        .row:last-child { border-bottom: none; }
        .READY { color: #4cd97b; }
        .WORKING, .WORKING_APPLYING { color: #5aa9ff; }
        .BUILDING, .BUILDING_WAITING { color: #ffb347; }
        .OFFLINE { color: #ff5a5a; }
    </style>
</head>
<body>
    <h1>Sparkvisor</h1>
    <div class="card" id="summary">Loading...</div>
    <div id="projects"></div>
    <script>
        async function refresh() {
            try {
                const s = await (await fetch('/api/summary')).json();
                document.getElementById('summary').innerHTML = `
                    <div class="row"><span>Live projects</span><b>${s.live_projects}</b></div>
                    <div class="row"><span>Listeners</span><b>${s.live_listeners}</b></div>
                    <div class="row"><span>Turns ok / failed</span><b>${s.turns_succeeded} / ${s.turns_failed}</b></div>
                    <div class="row"><span>Avg turn</span><b>${s.avg_turn_duration_ms.toFixed(0)}ms</b></div>`;

                const projects = await (await fetch('/api/projects')).json();
                document.getElementById('projects').innerHTML = projects.map(p => `
                    <div class="card">
                        <b>Project ${p.project_id}</b>
                        ${Object.entries(p.sandbox_statuses).map(([id, status]) =>
                            `<div class="row"><span>service ${id}</span><span class="${status}">${status}</span></div>`).join('')}
                    </div>`).join('');
            } catch (err) {
                console.error('refresh failed', err);
            }
        }
        refresh();
        setInterval(refresh, 2000);
    </script>
</body>
</html>
"#;
