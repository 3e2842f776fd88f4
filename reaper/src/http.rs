//! HTTP/JSON adapter for the platform seams.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ReapError, Result};
use crate::inventory::{Inventory, InventoryObject, ObjectKind, ObjectRef, TaskRef, ViewRef};
use crate::module::{ClusterModule, ClusterModules};
use crate::volume::{QueryFilter, VolumeCatalog, VolumePage};

/// Header carrying the session token.
pub const SESSION_HEADER: &str = "x-session-id";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Endpoint and credentials of the platform API.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification.
    pub insecure: bool,
}

#[derive(Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Deserialize)]
struct ObjectList {
    objects: Vec<ObjectRef>,
}

#[derive(Serialize)]
struct CreateViewRequest<'a> {
    root: &'a ObjectRef,
    kinds: &'a [ObjectKind],
    recursive: bool,
}

#[derive(Serialize)]
struct PropertiesRequest<'a> {
    objects: &'a [ObjectRef],
}

#[derive(Deserialize)]
struct PropertiesResponse {
    objects: Vec<InventoryObject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Deserialize)]
struct TaskInfo {
    state: TaskState,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct CustomFieldDef {
    key: i32,
    name: String,
}

#[derive(Deserialize)]
struct CustomFieldList {
    fields: Vec<CustomFieldDef>,
}

#[derive(Serialize)]
struct NewCustomField<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct CustomFieldValueBody<'a> {
    value: &'a str,
}

#[derive(Deserialize)]
struct ModuleList {
    modules: Vec<ClusterModule>,
}

#[derive(Deserialize)]
struct MemberList {
    members: Vec<ObjectRef>,
}

/// Platform client over the REST API.
#[derive(Clone)]
pub struct HttpPlatform {
    client: Client,
    base_url: String,
    session: String,
    poll_interval: Duration,
}

impl HttpPlatform {
    /// Open a session with basic auth.
    pub async fn login(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;
        let base_url = config.url.trim_end_matches('/').to_string();

        let response = client
            .post(format!("{}/session", base_url))
            .basic_auth(&config.username, Some(&config.password))
            .send()
            .await?;
        let session: SessionResponse = check(response).await?.json().await?;

        info!(url = %base_url, user = %config.username, "Logged in to platform");

        Ok(Self {
            client,
            base_url,
            session: session.token,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn logout(&self) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, "/session")).await?;
        debug!("Logged out of platform");
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, &self.session)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        check(request.send().await?).await?;
        Ok(())
    }
}

/// Map non-success statuses onto reaper errors.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        let what = if body.is_empty() { url } else { body };
        return Err(ReapError::NotFound(what));
    }
    Err(ReapError::Remote(format!("{} {}: {}", status, url, body)))
}

fn object_path(object: &ObjectRef, action: &str) -> String {
    format!("/inventory/objects/{}/{}/{}", object.kind, object.id, action)
}

#[async_trait]
impl Inventory for HttpPlatform {
    async fn resolve(&self, path: &str) -> Result<Vec<ObjectRef>> {
        let list: ObjectList = self
            .send(
                self.request(Method::GET, "/inventory/resolve")
                    .query(&[("path", path)]),
            )
            .await?;
        Ok(list.objects)
    }

    async fn create_container_view(
        &self,
        root: &ObjectRef,
        kinds: &[ObjectKind],
        recursive: bool,
    ) -> Result<ViewRef> {
        self.send(
            self.request(Method::POST, "/inventory/views")
                .json(&CreateViewRequest {
                    root,
                    kinds,
                    recursive,
                }),
        )
        .await
    }

    async fn find_in_view(&self, view: &ViewRef, name_pattern: &str) -> Result<Vec<ObjectRef>> {
        let list: ObjectList = self
            .send(
                self.request(Method::GET, &format!("/inventory/views/{}/objects", view.id))
                    .query(&[("name", name_pattern)]),
            )
            .await?;
        Ok(list.objects)
    }

    async fn destroy_view(&self, view: &ViewRef) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, &format!("/inventory/views/{}", view.id)))
            .await
    }

    async fn retrieve(&self, refs: &[ObjectRef]) -> Result<Vec<InventoryObject>> {
        let response: PropertiesResponse = self
            .send(
                self.request(Method::POST, "/inventory/properties")
                    .json(&PropertiesRequest { objects: refs }),
            )
            .await?;
        Ok(response.objects)
    }

    async fn power_off(&self, vm: &ObjectRef) -> Result<TaskRef> {
        self.send(self.request(Method::POST, &object_path(vm, "power-off")))
            .await
    }

    async fn destroy(&self, object: &ObjectRef) -> Result<TaskRef> {
        self.send(self.request(Method::POST, &object_path(object, "destroy")))
            .await
    }

    async fn wait_task(&self, task: &TaskRef) -> Result<()> {
        loop {
            let info: TaskInfo = self
                .send(self.request(Method::GET, &format!("/tasks/{}", task.id)))
                .await?;
            match info.state {
                TaskState::Success => return Ok(()),
                TaskState::Error => {
                    return Err(ReapError::Remote(
                        info.error.unwrap_or_else(|| format!("task {} failed", task.id)),
                    ));
                }
                TaskState::Queued | TaskState::Running => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn find_custom_field(&self, name: &str) -> Result<Option<i32>> {
        let list: CustomFieldList = self
            .send(
                self.request(Method::GET, "/custom-fields")
                    .query(&[("name", name)]),
            )
            .await?;
        Ok(list
            .fields
            .into_iter()
            .find(|f| f.name == name)
            .map(|f| f.key))
    }

    async fn add_custom_field(&self, name: &str) -> Result<i32> {
        let field: CustomFieldDef = self
            .send(
                self.request(Method::POST, "/custom-fields")
                    .json(&NewCustomField { name }),
            )
            .await?;
        Ok(field.key)
    }

    async fn set_custom_field(&self, object: &ObjectRef, key: i32, value: &str) -> Result<()> {
        self.send_empty(
            self.request(
                Method::PUT,
                &object_path(object, &format!("custom-fields/{}", key)),
            )
            .json(&CustomFieldValueBody { value }),
        )
        .await
    }
}

#[async_trait]
impl VolumeCatalog for HttpPlatform {
    async fn query(&self, filter: &QueryFilter) -> Result<VolumePage> {
        self.send(self.request(Method::POST, "/volumes/query").json(filter))
            .await
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<TaskRef> {
        self.send(self.request(Method::DELETE, &format!("/volumes/{}", volume_id)))
            .await
    }
}

#[async_trait]
impl ClusterModules for HttpPlatform {
    async fn list_modules(&self) -> Result<Vec<ClusterModule>> {
        let list: ModuleList = self
            .send(self.request(Method::GET, "/cluster-modules"))
            .await?;
        Ok(list.modules)
    }

    async fn list_members(&self, module_id: &str) -> Result<Vec<ObjectRef>> {
        let list: MemberList = self
            .send(self.request(
                Method::GET,
                &format!("/cluster-modules/{}/members", module_id),
            ))
            .await?;
        Ok(list.members)
    }

    async fn delete_module(&self, module_id: &str) -> Result<()> {
        self.send_empty(self.request(
            Method::DELETE,
            &format!("/cluster-modules/{}", module_id),
        ))
        .await
    }
}
