//! In-process mock agent for tests.
//!
//! Serves the same `/api` surface a real agent does, backed by
//! mutable state the test mutates to simulate stage progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::data::{AgentData, AgentInfo, MySqlDatabase, SeedMethodOpts};
use crate::seeds::{Engine, SeedMetadata, SeedMethod, SeedSide, SeedStageState};

#[derive(Clone)]
struct MockState {
    data: Arc<Mutex<AgentData>>,
    stage_state: Arc<Mutex<Option<SeedStageState>>>,
    metadata: Arc<Mutex<SeedMetadata>>,
    calls: Arc<Mutex<Vec<String>>>,
    reject_starts: Arc<AtomicBool>,
}

/// One mock agent bound to `<ip>:0`; the hostname of its `AgentInfo`
/// is the bind IP, so several agents can coexist on distinct loopback
/// addresses.
pub struct MockAgent {
    hostname: String,
    port: u16,
    mysql_port: u16,
    state: MockState,
    server: JoinHandle<()>,
}

impl MockAgent {
    /// Capability snapshot the mock starts with: one InnoDB user
    /// database and Mydumper offered with backup side Target.
    pub fn sample_data() -> AgentData {
        let mut databases = HashMap::new();
        databases.insert(
            "sakila".to_string(),
            MySqlDatabase {
                engines: vec![Engine::InnoDb],
                size: 0,
            },
        );
        let mut methods = HashMap::new();
        methods.insert(
            SeedMethod::Mydumper,
            SeedMethodOpts {
                backup_side: Some(SeedSide::Target),
                supported_engines: vec![
                    Engine::RocksDb,
                    Engine::MrgMyisam,
                    Engine::Csv,
                    Engine::Blackhole,
                    Engine::InnoDb,
                    Engine::Memory,
                    Engine::Archive,
                    Engine::MyIsam,
                    Engine::Federated,
                    Engine::TokuDb,
                ],
                backup_to_datadir: false,
            },
        );
        AgentData {
            local_snapshots_hosts: vec!["127.0.0.1".to_string()],
            snapshot_hosts: vec!["127.0.0.1".to_string(), "localhost".to_string()],
            backup_dir: "/tmp/bkp".to_string(),
            backup_dir_disk_free: 10000,
            mysql_running: true,
            mysql_datadir: "/var/lib/mysql".to_string(),
            mysql_datadir_disk_used: 10,
            mysql_datadir_disk_free: 10000,
            mysql_version: "5.7.25".to_string(),
            mysql_databases: databases,
            available_seed_methods: methods,
            ..AgentData::default()
        }
    }

    pub async fn spawn(bind_ip: &str) -> Self {
        Self::spawn_with_data(bind_ip, Self::sample_data()).await
    }

    pub async fn spawn_with_data(bind_ip: &str, data: AgentData) -> Self {
        let state = MockState {
            data: Arc::new(Mutex::new(data)),
            stage_state: Arc::new(Mutex::new(None)),
            metadata: Arc::new(Mutex::new(SeedMetadata::default())),
            calls: Arc::new(Mutex::new(Vec::new())),
            reject_starts: Arc::new(AtomicBool::new(false)),
        };

        let app = Router::new()
            .route("/api/get-agent-data", get(get_agent_data))
            .route("/api/umount", get(get_agent_data))
            .route("/api/prepare/:seed_id/:method/:side", get(start_sided))
            .route("/api/cleanup/:seed_id/:method/:side", get(start_sided))
            .route("/api/backup/:seed_id/:method/:host/:port", get(start_backup))
            .route("/api/restore/:seed_id/:method", get(start_plain))
            .route("/api/get-metadata/:seed_id/:method", get(get_metadata))
            .route("/api/seed-stage-state/:seed_id/:stage", get(stage_state))
            .route("/api/abort-seed/:seed_id", get(abort_seed))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind(format!("{}:0", bind_ip))
            .await
            .expect("bind mock agent");
        let port = listener.local_addr().expect("mock agent addr").port();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock agent");
        });

        Self {
            hostname: bind_ip.to_string(),
            port,
            mysql_port: 3306,
            state,
            server,
        }
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            hostname: self.hostname.clone(),
            port: self.port,
            token: "token".to_string(),
            mysql_port: self.mysql_port,
        }
    }

    pub async fn data(&self) -> AgentData {
        self.state.data.lock().await.clone()
    }

    pub async fn set_data(&self, data: AgentData) {
        *self.state.data.lock().await = data;
    }

    /// Commands the mock has accepted, as `command/args` paths.
    pub async fn calls(&self) -> Vec<String> {
        self.state.calls.lock().await.clone()
    }

    pub fn reject_starts(&self, reject: bool) {
        self.state.reject_starts.store(reject, Ordering::SeqCst);
    }

    pub async fn set_stage_state(&self, stage_state: SeedStageState) {
        *self.state.stage_state.lock().await = Some(stage_state);
    }

    pub async fn set_metadata(&self, metadata: SeedMetadata) {
        *self.state.metadata.lock().await = metadata;
    }

    pub fn shutdown(&self) {
        self.server.abort();
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn get_agent_data(State(state): State<MockState>) -> impl IntoResponse {
    Json(state.data.lock().await.clone())
}

async fn start_sided(
    State(state): State<MockState>,
    Path((seed_id, method, side)): Path<(i64, String, String)>,
    uri: axum::http::Uri,
) -> impl IntoResponse {
    let command = command_name(&uri);
    record_start(
        &state,
        format!("{}/{}/{}/{}", command, seed_id, method, side),
    )
    .await
}

async fn start_backup(
    State(state): State<MockState>,
    Path((seed_id, method, host, port)): Path<(i64, String, String, u16)>,
) -> impl IntoResponse {
    record_start(
        &state,
        format!("backup/{}/{}/{}/{}", seed_id, method, host, port),
    )
    .await
}

async fn start_plain(
    State(state): State<MockState>,
    Path((seed_id, method)): Path<(i64, String)>,
) -> impl IntoResponse {
    record_start(&state, format!("restore/{}/{}", seed_id, method)).await
}

async fn record_start(state: &MockState, call: String) -> (StatusCode, &'static str) {
    if state.reject_starts.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "rejected");
    }
    state.calls.lock().await.push(call);
    (StatusCode::ACCEPTED, "Started")
}

async fn get_metadata(
    State(state): State<MockState>,
    Path((_seed_id, _method)): Path<(i64, String)>,
) -> impl IntoResponse {
    Json(state.metadata.lock().await.clone())
}

async fn stage_state(
    State(state): State<MockState>,
    Path((_seed_id, _stage)): Path<(i64, String)>,
) -> axum::response::Response {
    match state.stage_state.lock().await.clone() {
        Some(stage_state) => Json(stage_state).into_response(),
        None => (StatusCode::NOT_FOUND, "no seed stage running").into_response(),
    }
}

async fn abort_seed(
    State(state): State<MockState>,
    Path(seed_id): Path<i64>,
) -> impl IntoResponse {
    state.calls.lock().await.push(format!("abort-seed/{}", seed_id));
    (StatusCode::OK, "killed")
}

fn command_name(uri: &axum::http::Uri) -> &'static str {
    if uri.path().starts_with("/api/prepare") {
        "prepare"
    } else {
        "cleanup"
    }
}
