use crate::config::{CacheBackend, Config, StorageBackend};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rill_core::{
    Connection, ConnectionId, DistributedStateRegistry, LocalCluster, MemoryStore,
    OutboundMessage, Record, RecordHandler, RedisCache, Result, RillError, SqliteStorage,
    SubscriptionBroadcaster, TargetVersion, UpdateStep, VersionStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use ulid::Ulid;

pub struct ServerState {
    pub server_name: String,
    pub records: Arc<RecordHandler>,
    pub registries: HashMap<String, DistributedStateRegistry>,
    pub cluster: LocalCluster,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, Json(resp)).into_response()
}

#[derive(Debug, Deserialize)]
struct UpdateRecordRequest {
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    path: Option<String>,
    data: Value,
    #[serde(default)]
    upsert: bool,
}

#[derive(Debug, Serialize)]
struct RecordResponse {
    name: String,
    version: u64,
    data: Value,
}

#[derive(Debug, Serialize)]
struct WriteResponse {
    name: String,
    correlation_id: String,
}

#[derive(Debug, Serialize)]
struct TopicResponse {
    topic: String,
    ready: bool,
    entries: std::collections::BTreeMap<String, std::collections::BTreeSet<String>>,
}

/// Connection for one HTTP write; outbound messages feed the waiting handler.
struct HttpConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Connection for HttpConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn user(&self) -> &str {
        "http"
    }

    fn send(&self, message: OutboundMessage) {
        // The request may already have returned.
        let _ = self.tx.send(message);
    }
}

/// HTTP clients do not subscribe, so accepted updates are only traced.
struct TracingBroadcaster;

impl SubscriptionBroadcaster for TracingBroadcaster {
    fn broadcast(&self, name: &str, step: &UpdateStep, is_remote: bool, exclude: &ConnectionId) {
        tracing::debug!(
            record = name,
            version = %step.version,
            is_remote,
            exclude = %exclude,
            "record updated"
        );
    }
}

async fn build_cache(config: &Config) -> Result<Arc<dyn VersionStore>> {
    Ok(match config.cache.backend {
        CacheBackend::Memory => Arc::new(MemoryStore::new()),
        CacheBackend::Redis => {
            let redis_config = config.cache.redis.as_ref().ok_or_else(|| {
                RillError::Config(
                    "redis configuration is required for redis cache backend".to_string(),
                )
            })?;
            Arc::new(RedisCache::new(&redis_config.url, redis_config.namespace_or_default()).await?)
        }
    })
}

fn build_storage(config: &Config) -> Result<Arc<dyn VersionStore>> {
    Ok(match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => {
            let sqlite_config = config.storage.sqlite.as_ref().ok_or_else(|| {
                RillError::Config(
                    "sqlite configuration is required for sqlite storage backend".to_string(),
                )
            })?;
            if let Some(parent) = sqlite_config.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(SqliteStorage::new(&sqlite_config.path)?)
        }
    })
}

pub fn build_state(
    config: &Config,
    cache: Arc<dyn VersionStore>,
    storage: Arc<dyn VersionStore>,
) -> Result<Arc<ServerState>> {
    let records = RecordHandler::new(&config.record, cache, storage, Arc::new(TracingBroadcaster))?;

    let cluster = LocalCluster::new();
    let bus = Arc::new(cluster.connect(config.server_name.clone()));
    let mut registries = HashMap::new();
    for topic in &config.cluster.topics {
        let registry = DistributedStateRegistry::new(
            topic.clone(),
            config.server_name.clone(),
            config.state.clone(),
            bus.clone(),
        );
        registry.set_servers(config.cluster.peers.iter().cloned());
        registries.insert(topic.clone(), registry);
    }

    Ok(Arc::new(ServerState {
        server_name: config.server_name.clone(),
        records,
        registries,
        cluster,
    }))
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/records/*name", get(get_record).put(put_record))
        .route("/topics/:topic", get(get_topic))
        .route("/topics/:topic/*name", post(add_entry).delete(remove_entry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let cache = build_cache(&config).await?;
    let storage = build_storage(&config)?;
    let state = build_state(&config, cache, storage)?;

    tracing::info!(
        "Server {} serving topics {:?} with peers {:?}",
        state.server_name,
        config.cluster.topics,
        config.cluster.peers
    );

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let registries: HashMap<&str, bool> = state
        .registries
        .iter()
        .map(|(topic, registry)| (topic.as_str(), registry.is_ready()))
        .collect();

    let response = serde_json::json!({
        "server_name": state.server_name,
        "status": "ok",
        "nodes": state.cluster.nodes(),
        "active_transitions": state.records.active_transitions().len(),
        "registries": registries,
    });

    (StatusCode::OK, Json(response))
}

async fn get_record(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Response {
    match state.records.get_record(&name).await {
        Ok(Some(Record { version, data })) => {
            ApiResponse::ok(RecordResponse {
                name,
                version,
                data,
            })
            .into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, RillError::RecordNotFound(name)),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn put_record(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(request): Json<UpdateRecordRequest>,
) -> Response {
    let version = TargetVersion::from(request.version);
    let correlation_id = Ulid::new().to_string();
    let step = match request.path {
        Some(path) => UpdateStep::patch(name.clone(), version, path, request.data),
        None => UpdateStep::update(name.clone(), version, request.data),
    }
    .with_write_ack(correlation_id.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = Arc::new(HttpConnection {
        id: ConnectionId::new(Ulid::new().to_string()),
        tx,
    });

    if let Err(e) = state.records.handle_update(connection, step, request.upsert) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }

    // The channel closes once the transition lets go of the connection.
    while let Some(message) = rx.recv().await {
        match message {
            OutboundMessage::WriteAcknowledgement {
                correlation_id: acked,
                ..
            } if acked == correlation_id => {
                return ApiResponse::ok(WriteResponse {
                    name,
                    correlation_id,
                })
                .into_response();
            }
            OutboundMessage::VersionExists { version, data, .. } => {
                let resp = ApiResponse {
                    success: false,
                    data: Some(RecordResponse {
                        name,
                        version,
                        data,
                    }),
                    error: Some(format!("version {} already exists", version)),
                };
                return (StatusCode::CONFLICT, Json(resp)).into_response();
            }
            OutboundMessage::InvalidMessageData { name, .. } => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    RillError::InvalidMessageData(name),
                );
            }
            OutboundMessage::RecordUpdateError { reason, .. } => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    reason.unwrap_or_else(|| format!("update of {} failed", name)),
                );
            }
            OutboundMessage::WriteAcknowledgement { .. } => {}
        }
    }

    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("update of {} ended without acknowledgement", name),
    )
}

async fn get_topic(
    State(state): State<Arc<ServerState>>,
    Path(topic): Path<String>,
) -> Response {
    match state.registries.get(&topic) {
        Some(registry) => ApiResponse::ok(TopicResponse {
            topic,
            ready: registry.is_ready(),
            entries: registry.get_all_map(),
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown topic {}", topic)),
    }
}

async fn add_entry(
    State(state): State<Arc<ServerState>>,
    Path((topic, name)): Path<(String, String)>,
) -> Response {
    match state.registries.get(&topic) {
        Some(registry) => {
            registry.add(&name);
            ApiResponse::ok(registry.get_all_servers(&name)).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("unknown topic {}", topic)),
    }
}

async fn remove_entry(
    State(state): State<Arc<ServerState>>,
    Path((topic, name)): Path<(String, String)>,
) -> Response {
    match state.registries.get(&topic) {
        Some(registry) => {
            registry.remove(&name);
            ApiResponse::ok(registry.get_all_servers(&name)).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("unknown topic {}", topic)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ClusterConfig, StorageConfig};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use rill_core::{RecordConfig, StateRegistryConfig};
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            server_name: "node-a".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            record: RecordConfig::default(),
            state: StateRegistryConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }

    fn test_app() -> (Router, Arc<MemoryStore>) {
        let storage = Arc::new(MemoryStore::new());
        let state =
            build_state(&test_config(), Arc::new(MemoryStore::new()), storage.clone()).unwrap();
        (router(state), storage)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_put_then_get_record() {
        let (app, storage) = test_app();

        let (status, _) = call(
            &app,
            Method::PUT,
            "/records/users/alice",
            Some(serde_json::json!({"data": {"name": "alice"}, "upsert": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(storage.snapshot("users/alice").unwrap().version, 1);

        let (status, _) = call(
            &app,
            Method::PUT,
            "/records/users/alice",
            Some(serde_json::json!({"version": 2, "path": "age", "data": 30})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, Method::GET, "/records/users/alice", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["version"], 2);
        assert_eq!(body["data"]["data"], serde_json::json!({"name": "alice", "age": 30}));
    }

    #[tokio::test]
    async fn test_put_reports_conflicts_and_bad_data() {
        let (app, _) = test_app();
        call(
            &app,
            Method::PUT,
            "/records/doc",
            Some(serde_json::json!({"data": {"v": 1}, "upsert": true})),
        )
        .await;

        let (status, body) = call(
            &app,
            Method::PUT,
            "/records/doc",
            Some(serde_json::json!({"version": 1, "data": {"v": 2}})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["data"]["version"], 1);

        let (status, _) = call(
            &app,
            Method::PUT,
            "/records/doc",
            Some(serde_json::json!({"data": "not an object"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            Method::PUT,
            "/records/missing",
            Some(serde_json::json!({"data": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = call(&app, Method::GET, "/records/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_topic_entries() {
        let (app, _) = test_app();

        let (status, body) = call(&app, Method::POST, "/topics/presence/alice", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], serde_json::json!(["node-a"]));

        let (status, body) = call(&app, Method::GET, "/topics/presence", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ready"], true);
        assert_eq!(body["data"]["entries"], serde_json::json!({"alice": ["node-a"]}));

        let (status, body) = call(&app, Method::DELETE, "/topics/presence/alice", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], serde_json::json!([]));

        let (status, _) = call(&app, Method::GET, "/topics/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_registry_readiness() {
        let (app, _) = test_app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_name"], "node-a");
        assert_eq!(body["registries"]["presence"], true);
        assert_eq!(body["registries"]["subscriptions"], true);
    }
}
