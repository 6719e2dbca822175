//! vSphere API client
//!
//! Implements the vim25 operations the provisioner needs over the VI/JSON
//! API (`/sdk/vim25/{release}/...`), available on vCenter and ESXi 8.0U1+.
//! Every `*_Task` method is polled through `Task/{id}/info` until it
//! finishes.

use crate::error::VSphereError;
use crate::models::*;
use crate::vsphere_trait::VSphereClientTrait;
use crate::wire;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SESSION_HEADER: &str = "vmware-api-session-id";
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// vSphere API client
pub struct VSphereClient {
    client: Client,
    config: VSphereConfig,
    base_url: String,
    session: RwLock<Option<String>>,
    task_timeout: Duration,
}

impl std::fmt::Debug for VSphereClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VSphereClient")
            .field("base_url", &self.base_url)
            .field("username", &self.config.username)
            .finish_non_exhaustive()
    }
}

impl VSphereClient {
    /// Create a new vSphere client
    ///
    /// No session is opened until the first call.
    pub fn new(config: VSphereConfig) -> Result<Self, VSphereError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        let host = config.host.trim_start_matches("https://").trim_end_matches('/').to_string();
        Ok(Self {
            base_url: format!("https://{}/sdk/vim25/{}", host, config.api_release),
            config: VSphereConfig { host, ..config },
            client,
            session: RwLock::new(None),
            task_timeout: Duration::from_secs(600),
        })
    }

    /// Override how long a task may run before it is reported as timed out
    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn config(&self) -> &VSphereConfig {
        &self.config
    }

    async fn login(&self) -> Result<String, VSphereError> {
        let content: Value = self
            .client
            .get(format!("{}/ServiceInstance/ServiceInstance/content", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let session_manager = content
            .pointer("/sessionManager/value")
            .and_then(Value::as_str)
            .unwrap_or("SessionManager");

        let response = self
            .client
            .post(format!("{}/SessionManager/{}/Login", self.base_url, session_manager))
            .json(&json!({"userName": self.config.username, "password": self.config.password}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (_, message) = wire::fault_from_body(&body);
            return Err(VSphereError::Authentication(format!("{status} - {message}")));
        }
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| VSphereError::Authentication("login returned no session id".to_string()))?;

        info!("Opened vSphere session on {} as {}", self.config.host, self.config.username);
        Ok(session)
    }

    async fn session_id(&self) -> Result<String, VSphereError> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }
        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Send one API request, renewing the session once on 401
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, VSphereError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut renewed = false;

        loop {
            let session = self.session_id().await?;
            debug!("vSphere {} {}", method, path);
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header(SESSION_HEADER, &session)
                .header("Accept", "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !renewed {
                warn!("vSphere session expired, logging in again");
                *self.session.write().await = None;
                renewed = true;
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                let (fault, message) = wire::fault_from_body(&text);
                return Err(VSphereError::Api {
                    status: status.as_u16(),
                    fault,
                    message,
                });
            }
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }
    }

    async fn get_property(&self, kind: &str, id: &str, property: &str) -> Result<Value, VSphereError> {
        self.request(Method::GET, &format!("{kind}/{id}/{property}"), None).await
    }

    /// Invoke a `*_Task` method and wait for the task, returning its result
    async fn run_task(&self, operation: &str, path: &str, body: &Value) -> Result<Value, VSphereError> {
        let task = self.request(Method::POST, path, Some(body)).await?;
        let task_id = wire::moref_value(&task)
            .ok_or_else(|| VSphereError::InvalidRequest(format!("{operation} returned no task reference")))?;
        self.wait_for_task(operation, &task_id).await
    }

    async fn wait_for_task(&self, operation: &str, task_id: &str) -> Result<Value, VSphereError> {
        let deadline = Instant::now() + self.task_timeout;
        loop {
            let info: wire::WireTaskInfo = serde_json::from_value(self.get_property("Task", task_id, "info").await?)?;
            match info.state {
                TaskState::Success => return Ok(info.result.unwrap_or(Value::Null)),
                TaskState::Error => {
                    let (fault, message) = info
                        .error
                        .as_ref()
                        .map(wire::fault_details)
                        .unwrap_or((None, "task failed without a fault".to_string()));
                    return Err(VSphereError::Task {
                        operation: operation.to_string(),
                        fault,
                        message,
                    });
                }
                TaskState::Queued | TaskState::Running => {}
            }
            if Instant::now() >= deadline {
                return Err(VSphereError::Timeout(format!("{operation} task {task_id}")));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    fn resource_pool(&self) -> Value {
        wire::moref("ResourcePool", &self.config.resource_pool)
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait::async_trait]
impl VSphereClientTrait for VSphereClient {
    fn host(&self) -> &str {
        &self.config.host
    }

    fn datastore(&self) -> &str {
        &self.config.datastore
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<String, VSphereError> {
        let body = json!({
            "config": wire::config_spec(spec, &self.config.datastore),
            "pool": self.resource_pool(),
        });
        let path = format!("Folder/{}/CreateVM_Task", self.config.folder);
        let result = self.run_task("CreateVM_Task", &path, &body).await?;
        wire::moref_value(&result)
            .ok_or_else(|| VSphereError::InvalidRequest(format!("CreateVM_Task for {} returned no VM", spec.name)))
    }

    async fn get_vm_info(&self, vm_id: &str) -> Result<VmInfo, VSphereError> {
        let config = self.get_property("VirtualMachine", vm_id, "config").await?;
        let runtime = self.get_property("VirtualMachine", vm_id, "runtime").await?;
        wire::vm_info_from_wire(vm_id, &config, &runtime)
    }

    async fn reconfigure_vm(&self, vm_id: &str, changes: &[DeviceChange]) -> Result<(), VSphereError> {
        let path = format!("VirtualMachine/{vm_id}/ReconfigVM_Task");
        self.run_task("ReconfigVM_Task", &path, &wire::reconfig_spec(changes))
            .await?;
        Ok(())
    }

    async fn unregister_vm(&self, vm_id: &str) -> Result<(), VSphereError> {
        self.request(Method::POST, &format!("VirtualMachine/{vm_id}/UnregisterVM"), None)
            .await?;
        Ok(())
    }

    async fn register_vm(&self, vmx_path: &str, name: &str) -> Result<String, VSphereError> {
        let body = json!({
            "path": vmx_path,
            "name": name,
            "asTemplate": false,
            "pool": self.resource_pool(),
        });
        let path = format!("Folder/{}/RegisterVM_Task", self.config.folder);
        let result = self.run_task("RegisterVM_Task", &path, &body).await?;
        wire::moref_value(&result)
            .ok_or_else(|| VSphereError::InvalidRequest(format!("RegisterVM_Task for {name} returned no VM")))
    }

    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>, VSphereError> {
        Ok(self.list_vms().await?.into_iter().find(|vm| vm.name == name))
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>, VSphereError> {
        let children = self.get_property("Folder", &self.config.folder, "childEntity").await?;
        let ids: Vec<String> = children
            .as_array()
            .map(|refs| {
                refs.iter()
                    .filter(|r| r.get("type").and_then(Value::as_str) == Some("VirtualMachine"))
                    .filter_map(wire::moref_value)
                    .collect()
            })
            .unwrap_or_default();

        let mut vms = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_vm_info(&id).await {
                Ok(vm) => vms.push(vm),
                // VM removed between listing and reading it
                Err(VSphereError::Api { status: 404 | 500, fault: Some(ref fault), .. })
                    if fault == "ManagedObjectNotFound" => {}
                Err(e) => return Err(e),
            }
        }
        Ok(vms)
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), VSphereError> {
        let path = format!("VirtualMachine/{vm_id}/PowerOnVM_Task");
        self.run_task("PowerOnVM_Task", &path, &json!({})).await?;
        Ok(())
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), VSphereError> {
        let path = format!("VirtualMachine/{vm_id}/PowerOffVM_Task");
        self.run_task("PowerOffVM_Task", &path, &json!({})).await?;
        Ok(())
    }

    async fn destroy_vm(&self, vm_id: &str) -> Result<(), VSphereError> {
        let path = format!("VirtualMachine/{vm_id}/Destroy_Task");
        self.run_task("Destroy_Task", &path, &json!({})).await?;
        Ok(())
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<String, VSphereError> {
        let file = tokio::fs::File::open(local_path).await?;
        let length = file.metadata().await?.len();
        let remote_path = remote_path.trim_start_matches('/');
        let url = format!(
            "https://{}/folder/{}?dcPath={}&dsName={}",
            self.config.host,
            encode_path(remote_path),
            urlencoding::encode(&self.config.datacenter),
            urlencoding::encode(&self.config.datastore),
        );

        info!(
            "Uploading {} ({} bytes) to [{}] {}",
            local_path.display(),
            length,
            self.config.datastore,
            remote_path
        );
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));
        let response = self
            .client
            .put(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", length)
            .timeout(Duration::from_secs(3600))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VSphereError::Api {
                status: status.as_u16(),
                fault: None,
                message: format!("upload of {remote_path} failed: {}", body.chars().take(500).collect::<String>()),
            });
        }
        Ok(format!("[{}] {}", self.config.datastore, remote_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let client = VSphereClient::new(VSphereConfig::esxi("https://esxi01.lab/", "root", "secret", "datastore1")).unwrap();
        assert_eq!(client.host(), "esxi01.lab");
        assert_eq!(client.base_url, "https://esxi01.lab/sdk/vim25/8.0.2.0");
        assert_eq!(client.datastore(), "datastore1");
    }

    #[test]
    fn test_encode_path_keeps_separators() {
        assert_eq!(encode_path("iso/talos v1.9.iso"), "iso/talos%20v1.9.iso");
    }
}
