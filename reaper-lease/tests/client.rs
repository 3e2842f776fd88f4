//! Lease client against an in-process broker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Json, Router};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use reaper_lease::client::type_not_found_message;
use reaper_lease::{LeaseClient, LeaseError, ResourceState};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Default)]
struct Broker {
    /// (name, type, state)
    resources: Mutex<Vec<(String, String, String)>>,
    released: Mutex<Vec<(String, String)>>,
    metric_failures: AtomicUsize,
}

type Params = Query<HashMap<String, String>>;

async fn acquire(State(broker): State<Arc<Broker>>, Query(q): Params) -> Response {
    if q.get("type").map(String::as_str) == Some("unknown") {
        return (StatusCode::NOT_FOUND, type_not_found_message("unknown")).into_response();
    }
    let mut resources = broker.resources.lock().await;
    let found = resources
        .iter_mut()
        .find(|(_, rtype, state)| Some(rtype) == q.get("type") && Some(state) == q.get("state"));
    match found {
        Some((name, rtype, state)) => {
            *state = q["dest"].clone();
            Json(json!({
                "type": rtype,
                "name": name,
                "state": state,
                "owner": q["owner"],
                "lastupdate": "2024-05-01T10:00:00Z",
                "userdata": {"folder": format!("/DC0/vm/{}", name), "resourcePool": format!("/DC0/host/C0/Resources/{}", name)}
            }))
            .into_response()
        }
        None => (StatusCode::NOT_FOUND, "no resource").into_response(),
    }
}

async fn release(State(broker): State<Arc<Broker>>, Query(q): Params) -> StatusCode {
    broker
        .released
        .lock()
        .await
        .push((q["name"].clone(), q["dest"].clone()));
    StatusCode::OK
}

async fn metric(State(broker): State<Arc<Broker>>, Query(q): Params) -> Response {
    if broker.metric_failures.load(Ordering::SeqCst) > 0 {
        broker.metric_failures.fetch_sub(1, Ordering::SeqCst);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({
        "type": q["type"],
        "current": {"dirty": 1, "free": 3},
        "owner": {"reaper": 1}
    }))
    .into_response()
}

async fn spawn(broker: Arc<Broker>) -> SocketAddr {
    let router = Router::new()
        .route("/acquire", post(acquire))
        .route("/release", post(release))
        .route("/update", post(|| async { StatusCode::OK }))
        .route("/metric", get(metric))
        .with_state(broker);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr) -> LeaseClient {
    LeaseClient::new("reaper", &format!("http://{}", addr))
        .unwrap()
        .with_backoff(Duration::from_millis(1))
}

#[tokio::test]
async fn test_acquire_moves_resource_and_then_runs_dry() {
    let broker = Arc::new(Broker::default());
    broker
        .resources
        .lock()
        .await
        .push(("p1".into(), "vsphere".into(), "dirty".into()));
    let client = client(spawn(broker.clone()).await);

    let resource = client
        .acquire("vsphere", ResourceState::Dirty, ResourceState::Cleaning)
        .await
        .unwrap();
    assert_eq!(resource.name, "p1");
    assert_eq!(resource.state, ResourceState::Cleaning);
    assert_eq!(resource.owner, "reaper");
    assert_eq!(
        resource.user_data.unwrap().get("folder"),
        Some("/DC0/vm/p1")
    );

    let err = client
        .acquire("vsphere", ResourceState::Dirty, ResourceState::Cleaning)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
}

#[tokio::test]
async fn test_unknown_type_is_distinguished() {
    let client = client(spawn(Arc::new(Broker::default())).await);
    let err = client
        .acquire("unknown", ResourceState::Dirty, ResourceState::Cleaning)
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::TypeNotFound(t) if t == "unknown"));
}

#[tokio::test]
async fn test_release_sends_destination_state() {
    let broker = Arc::new(Broker::default());
    let client = client(spawn(broker.clone()).await);

    client.release("p1", ResourceState::Free).await.unwrap();
    client
        .update("p1", ResourceState::Cleaning, None)
        .await
        .unwrap();

    assert_eq!(
        *broker.released.lock().await,
        vec![("p1".to_string(), "free".to_string())]
    );
}

#[tokio::test]
async fn test_metric_retries_server_errors() {
    let broker = Arc::new(Broker::default());
    broker.metric_failures.store(2, Ordering::SeqCst);
    let client = client(spawn(broker.clone()).await);

    let metric = client.metric("vsphere").await.unwrap();
    assert_eq!(metric.current.get("free"), Some(&3));
    assert_eq!(metric.owners.get("reaper"), Some(&1));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let broker = Arc::new(Broker::default());
    broker.metric_failures.store(10, Ordering::SeqCst);
    let client = client(spawn(broker).await);

    let err = client.metric("vsphere").await.unwrap_err();
    match err {
        LeaseError::RetriesExhausted { errors, .. } => assert_eq!(errors.len(), 4),
        other => panic!("expected exhausted retries, got {other:?}"),
    }
}
