//! Shared test utilities for reaper integration tests.
//!
//! `PlatformServer` serves the platform REST API over a `MemoryPlatform`, so
//! the HTTP adapter can be checked against the same state the engine tests
//! use. `BrokerServer` is a minimal lease broker.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use reaper::http::SESSION_HEADER;
use reaper::inventory::{Inventory, ObjectKind, ObjectRef, TaskRef};
use reaper::memory::MemoryPlatform;
use reaper::module::ClusterModules;
use reaper::volume::{QueryFilter, VolumeCatalog};
use reaper::{HttpConfig, HttpPlatform, ReapError};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "secret";
const BASIC_AUTH: &str = "Basic YWRtaW46c2VjcmV0";
const TOKEN: &str = "session-1";

/// Bind a router on a free local port and serve it in the background.
async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server error");
    });
    addr
}

// === Platform API ===

struct ApiError(StatusCode, String);

impl From<ReapError> for ApiError {
    fn from(err: ReapError) -> Self {
        match err {
            ReapError::NotFound(what) => ApiError(StatusCode::NOT_FOUND, what),
            other => ApiError(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

struct PlatformState {
    platform: Arc<MemoryPlatform>,
    /// Tasks that already answered "running" once.
    polled: Mutex<HashSet<String>>,
    logged_out: Mutex<bool>,
}

fn authorize(headers: &HeaderMap) -> Result<(), ApiError> {
    match headers.get(SESSION_HEADER) {
        Some(value) if value == TOKEN => Ok(()),
        _ => Err(ApiError(StatusCode::UNAUTHORIZED, "no session".into())),
    }
}

fn ok(value: impl serde::Serialize) -> ApiResult {
    Ok(Json(serde_json::to_value(value).expect("Failed to encode")))
}

async fn login(headers: HeaderMap) -> ApiResult {
    match headers.get(header::AUTHORIZATION) {
        Some(value) if value == BASIC_AUTH => ok(json!({ "token": TOKEN })),
        _ => Err(ApiError(StatusCode::UNAUTHORIZED, "bad credentials".into())),
    }
}

async fn logout(State(s): State<Arc<PlatformState>>, headers: HeaderMap) -> ApiResult {
    authorize(&headers)?;
    *s.logged_out.lock().await = true;
    ok(json!({}))
}

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

async fn resolve(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Query(q): Query<PathQuery>,
) -> ApiResult {
    authorize(&headers)?;
    ok(json!({ "objects": s.platform.resolve(&q.path).await? }))
}

#[derive(Deserialize)]
struct ViewRequest {
    root: ObjectRef,
    kinds: Vec<ObjectKind>,
    recursive: bool,
}

async fn create_view(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Json(req): Json<ViewRequest>,
) -> ApiResult {
    authorize(&headers)?;
    ok(s.platform
        .create_container_view(&req.root, &req.kinds, req.recursive)
        .await?)
}

#[derive(Deserialize)]
struct NameQuery {
    name: String,
}

async fn view_objects(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<NameQuery>,
) -> ApiResult {
    authorize(&headers)?;
    let view = reaper::inventory::ViewRef { id };
    ok(json!({ "objects": s.platform.find_in_view(&view, &q.name).await? }))
}

async fn destroy_view(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    authorize(&headers)?;
    s.platform
        .destroy_view(&reaper::inventory::ViewRef { id })
        .await?;
    ok(json!({}))
}

#[derive(Deserialize)]
struct PropertiesRequest {
    objects: Vec<ObjectRef>,
}

async fn properties(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Json(req): Json<PropertiesRequest>,
) -> ApiResult {
    authorize(&headers)?;
    ok(json!({ "objects": s.platform.retrieve(&req.objects).await? }))
}

async fn object_action(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Path((kind, id, action)): Path<(String, String, String)>,
) -> ApiResult {
    authorize(&headers)?;
    let object = ObjectRef::new(ObjectKind::from(kind), id);
    let task = match action.as_str() {
        "power-off" => s.platform.power_off(&object).await?,
        "destroy" => s.platform.destroy(&object).await?,
        other => return Err(ApiError(StatusCode::NOT_FOUND, format!("no action {}", other))),
    };
    ok(task)
}

#[derive(Deserialize)]
struct ValueBody {
    value: String,
}

async fn set_custom_field(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Path((kind, id, key)): Path<(String, String, i32)>,
    Json(body): Json<ValueBody>,
) -> ApiResult {
    authorize(&headers)?;
    let object = ObjectRef::new(ObjectKind::from(kind), id);
    s.platform.set_custom_field(&object, key, &body.value).await?;
    ok(json!({}))
}

async fn task(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    authorize(&headers)?;
    if s.polled.lock().await.insert(id.clone()) {
        return ok(json!({ "state": "running" }));
    }
    match s.platform.wait_task(&TaskRef { id }).await {
        Ok(()) => ok(json!({ "state": "success" })),
        Err(ReapError::Remote(message)) => ok(json!({ "state": "error", "error": message })),
        Err(other) => Err(other.into()),
    }
}

async fn find_custom_field(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Query(q): Query<NameQuery>,
) -> ApiResult {
    authorize(&headers)?;
    let fields = match s.platform.find_custom_field(&q.name).await? {
        Some(key) => vec![json!({ "key": key, "name": q.name })],
        None => vec![],
    };
    ok(json!({ "fields": fields }))
}

async fn add_custom_field(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Json(body): Json<NameQuery>,
) -> ApiResult {
    authorize(&headers)?;
    let key = s.platform.add_custom_field(&body.name).await?;
    ok(json!({ "key": key, "name": body.name }))
}

async fn query_volumes(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Json(filter): Json<QueryFilter>,
) -> ApiResult {
    authorize(&headers)?;
    ok(s.platform.query(&filter).await?)
}

async fn delete_volume(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    authorize(&headers)?;
    ok(s.platform.delete_volume(&id).await?)
}

async fn list_modules(State(s): State<Arc<PlatformState>>, headers: HeaderMap) -> ApiResult {
    authorize(&headers)?;
    ok(json!({ "modules": s.platform.list_modules().await? }))
}

async fn list_members(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    authorize(&headers)?;
    ok(json!({ "members": s.platform.list_members(&id).await? }))
}

async fn delete_module(
    State(s): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    authorize(&headers)?;
    s.platform.delete_module(&id).await?;
    ok(json!({}))
}

/// Platform REST API backed by a `MemoryPlatform`.
pub struct PlatformServer {
    pub addr: SocketAddr,
    state: Arc<PlatformState>,
}

impl PlatformServer {
    pub async fn spawn(platform: Arc<MemoryPlatform>) -> Self {
        let state = Arc::new(PlatformState {
            platform,
            polled: Mutex::new(HashSet::new()),
            logged_out: Mutex::new(false),
        });

        let router = Router::new()
            .route("/session", post(login).delete(logout))
            .route("/inventory/resolve", get(resolve))
            .route("/inventory/views", post(create_view))
            .route("/inventory/views/{id}", delete(destroy_view))
            .route("/inventory/views/{id}/objects", get(view_objects))
            .route("/inventory/properties", post(properties))
            .route("/inventory/objects/{kind}/{id}/{action}", post(object_action))
            .route(
                "/inventory/objects/{kind}/{id}/custom-fields/{key}",
                put(set_custom_field),
            )
            .route("/tasks/{id}", get(task))
            .route("/custom-fields", get(find_custom_field).post(add_custom_field))
            .route("/volumes/query", post(query_volumes))
            .route("/volumes/{id}", delete(delete_volume))
            .route("/cluster-modules", get(list_modules))
            .route("/cluster-modules/{id}", delete(delete_module))
            .route("/cluster-modules/{id}/members", get(list_members))
            .with_state(Arc::clone(&state));

        Self {
            addr: serve(router).await,
            state,
        }
    }

    pub fn config(&self) -> HttpConfig {
        HttpConfig {
            url: format!("http://{}", self.addr),
            username: USERNAME.to_string(),
            password: PASSWORD.to_string(),
            insecure: false,
        }
    }

    /// Log in with fast task polling.
    pub async fn client(&self) -> Arc<HttpPlatform> {
        let platform = HttpPlatform::login(&self.config())
            .await
            .expect("Failed to log in");
        Arc::new(platform.with_poll_interval(Duration::from_millis(5)))
    }

    pub async fn logged_out(&self) -> bool {
        *self.state.logged_out.lock().await
    }
}

// === Lease broker ===

#[derive(Debug, Clone)]
pub struct BrokerResource {
    pub name: String,
    pub resource_type: String,
    pub state: String,
    pub user_data: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    resources: Mutex<Vec<BrokerResource>>,
}

type Params = Query<HashMap<String, String>>;

async fn acquire(State(s): State<Arc<BrokerState>>, Query(q): Params) -> Response {
    let mut resources = s.resources.lock().await;
    let found = resources.iter_mut().find(|r| {
        Some(&r.resource_type) == q.get("type") && Some(&r.state) == q.get("state")
    });
    let Some(resource) = found else {
        return (StatusCode::NOT_FOUND, "no resource").into_response();
    };
    resource.state = q.get("dest").cloned().unwrap_or_default();

    Json(json!({
        "type": resource.resource_type,
        "name": resource.name,
        "state": resource.state,
        "owner": q.get("owner"),
        "lastupdate": "2024-05-01T10:00:00Z",
        "userdata": resource.user_data,
    }))
    .into_response()
}

async fn release(State(s): State<Arc<BrokerState>>, Query(q): Params) -> StatusCode {
    let mut resources = s.resources.lock().await;
    match resources.iter_mut().find(|r| Some(&r.name) == q.get("name")) {
        Some(resource) => {
            resource.state = q.get("dest").cloned().unwrap_or_default();
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn metric(Query(q): Params) -> Json<Value> {
    Json(json!({ "type": q.get("type"), "current": {}, "owner": {} }))
}

/// Lease broker holding a fixed set of resources.
pub struct BrokerServer {
    pub addr: SocketAddr,
    state: Arc<BrokerState>,
}

impl BrokerServer {
    pub async fn spawn(resources: Vec<BrokerResource>) -> Self {
        let state = Arc::new(BrokerState {
            resources: Mutex::new(resources),
        });
        let router = Router::new()
            .route("/acquire", post(acquire))
            .route("/release", post(release))
            .route("/metric", get(metric))
            .with_state(Arc::clone(&state));

        Self {
            addr: serve(router).await,
            state,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Current state of every resource, by name.
    pub async fn states(&self) -> HashMap<String, String> {
        self.state
            .resources
            .lock()
            .await
            .iter()
            .map(|r| (r.name.clone(), r.state.clone()))
            .collect()
    }
}

/// A dirty resource whose user data points at `folder` and `pool`.
pub fn dirty_resource(name: &str, folder: Option<&str>, pool: Option<&str>) -> BrokerResource {
    let mut user_data = HashMap::new();
    if let Some(folder) = folder {
        user_data.insert("folder".to_string(), folder.to_string());
    }
    if let Some(pool) = pool {
        user_data.insert("resourcePool".to_string(), pool.to_string());
    }
    BrokerResource {
        name: name.to_string(),
        resource_type: "vsphere-project".to_string(),
        state: "dirty".to_string(),
        user_data,
    }
}
