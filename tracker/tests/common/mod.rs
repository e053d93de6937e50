//! Shared helpers for integration tests
//!
//! `FakeServer` stands in for the tracker API. It hands out sequential
//! server ids, records every request it receives and can be switched
//! offline or told to fail specific paths. Like the real server it answers
//! 404 for requests that reference ids it never issued.

#![allow(dead_code)]

use async_trait::async_trait;
use rideshare_tracker::api::{HttpRequest, HttpResponse, HttpTransport};
use rideshare_tracker::config::SETTINGS_FILE_NAME;
use rideshare_tracker::database::HttpMethod;
use rideshare_tracker::services::{AppSettings, SyncReport};
use rideshare_tracker::{App, AppError, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const BASE_URL: &str = "https://tracker.test";
pub const TOKEN: &str = "device-token-1";

#[derive(Default)]
struct ServerState {
    offline: bool,
    next_id: u32,
    requests: Vec<HttpRequest>,
    failures: Vec<(String, u16)>,
    issued: HashSet<String>,
    delay: Duration,
}

impl ServerState {
    fn issue_id(&mut self) -> String {
        self.next_id += 1;
        let id = format!("server-{}", self.next_id);
        self.issued.insert(id.clone());
        id
    }
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().unwrap().offline = !online;
    }

    /// Answer every request whose path contains `fragment` with `status`
    pub fn fail_path(&self, fragment: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((fragment.to_string(), status));
    }

    /// Hold every response for `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Paths of received requests, in order, without the base URL
    pub fn paths(&self) -> Vec<String> {
        self.requests().iter().map(|r| path_of(&r.url)).collect()
    }

    pub fn requests_to(&self, fragment: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(fragment))
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().requests.clear();
    }
}

fn path_of(url: &str) -> String {
    url.strip_prefix(BASE_URL).unwrap_or(url).to_string()
}

/// Entity id embedded in an `/v1/shifts/{id}/..` or `/v1/rides/{id}/..` path
fn path_entity(path: &str) -> Option<&str> {
    let rest = path
        .strip_prefix("/v1/shifts/")
        .or_else(|| path.strip_prefix("/v1/rides/"))?;
    rest.split('/').next()
}

fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        content_type: Some("application/json".to_string()),
        body: body.to_string(),
    }
}

#[async_trait]
impl HttpTransport for FakeServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let delay = self.state.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(AppError::Network("connection refused".to_string()));
        }
        state.requests.push(request.clone());

        let path = path_of(&request.url);
        if let Some((_, status)) = state.failures.iter().find(|(f, _)| path.contains(f.as_str())) {
            return Ok(json_response(*status, json!({ "error": "scripted failure" })));
        }

        let body: Value = request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or(Value::Null);

        let unknown = match (path_entity(&path), body.get("shift_id").and_then(Value::as_str)) {
            (Some(id), _) => !state.issued.contains(id),
            (None, Some(shift_id)) => !state.issued.contains(shift_id),
            (None, None) => false,
        };
        if unknown {
            return Ok(json_response(404, json!({ "error": "not found" })));
        }

        let response = match (request.method, path.as_str()) {
            (HttpMethod::Post, "/v1/shifts") | (HttpMethod::Post, "/v1/rides") => {
                json!({ "id": state.issue_id() })
            }
            (HttpMethod::Post, "/v1/expenses") => {
                let id = state.issue_id();
                let receipt_url = body
                    .get("receipt_base64")
                    .map(|_| format!("{}/receipts/{}.jpg", BASE_URL, id));
                json!({ "id": id, "receipt_url": receipt_url })
            }
            (HttpMethod::Post, "/v1/location") => {
                let inserted = body
                    .get("pings")
                    .and_then(Value::as_array)
                    .map_or(0, |p| p.len());
                json!({ "inserted": inserted })
            }
            _ => json!({ "ok": true }),
        };

        Ok(json_response(200, response))
    }
}

/// An app in a temporary directory talking to a `FakeServer`
pub struct TestApp {
    pub app: App,
    pub server: Arc<FakeServer>,
    pub dir: TempDir,
}

impl TestApp {
    /// Paired app with no backoff between attempts and an hour-long sync
    /// interval, so background cycles only run when nudged
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    pub async fn with_settings(configure: impl FnOnce(&mut AppSettings)) -> Self {
        let app = Self::unpaired_with(configure).await;
        app.app
            .settings_service
            .set_api_base_url(BASE_URL)
            .await
            .unwrap();
        app.app.settings_service.set_device_token(TOKEN).await.unwrap();
        app
    }

    /// App without base URL or token
    pub async fn unpaired() -> Self {
        Self::unpaired_with(|_| {}).await
    }

    async fn unpaired_with(configure: impl FnOnce(&mut AppSettings)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut settings = AppSettings::default();
        settings.api.base_backoff_ms = 0;
        settings.sync.interval_secs = 3600;
        settings.tracker.shift_summary_delay_secs = 3600;
        configure(&mut settings);
        std::fs::write(
            dir.path().join(SETTINGS_FILE_NAME),
            serde_json::to_string_pretty(&settings).unwrap(),
        )
        .unwrap();

        let server = FakeServer::new();
        let app = App::open_with(dir.path(), server.clone()).await.unwrap();

        Self { app, server, dir }
    }

    /// Open a second app on the same directory, as after a process restart
    pub async fn reopen(&self) -> App {
        self.app.shutdown().await;
        App::open_with(self.dir.path(), self.server.clone())
            .await
            .unwrap()
    }

    /// Start a shift and stop the background loop so tests drive sync
    pub async fn start_shift_manual(&self) {
        self.app.tracker.start_shift().await.unwrap();
        self.app.sync.stop().await;
    }

    pub fn shift_id(&self) -> String {
        self.app.tracker.view().shift.unwrap().id
    }

    pub fn ride_id(&self) -> String {
        self.app.tracker.view().ride.unwrap().id
    }

    /// Run sync cycles until the outbox is empty, summing the reports
    pub async fn drain(&self) -> SyncReport {
        let mut total = SyncReport::default();
        for _ in 0..5 {
            let report = self.app.sync.trigger().await.unwrap();
            total.sent += report.sent;
            total.failed += report.failed;
            total.rewritten += report.rewritten;
            total.duplicates += report.duplicates;
            total.deferred += report.deferred;
            total.pings_uploaded += report.pings_uploaded;
            total.requests_purged += report.requests_purged;
            total.pings_purged += report.pings_purged;
            if self.app.outbox.count().await.unwrap() == 0 {
                break;
            }
        }
        total
    }
}
