//! TrueNAS middleware client
//!
//! Speaks JSON-RPC 2.0 over one persistent websocket at `/api/current`,
//! authenticated with an API key. The session is shared by every call on this
//! client and serialized behind an async mutex: the middleware answers in
//! order per connection, and interleaved readers would steal each other's
//! responses.

use crate::error::TrueNasError;
use crate::models::*;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::truenas_trait::TrueNasClientTrait;
use futures::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// TrueNAS middleware client
pub struct TrueNasClient {
    host: String,
    url: String,
    api_key: String,
    verify_tls: bool,
    timeout: Duration,
    job_timeout: Duration,
    session: Mutex<Option<Socket>>,
}

impl std::fmt::Debug for TrueNasClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrueNasClient")
            .field("url", &self.url)
            .field("verify_tls", &self.verify_tls)
            .finish_non_exhaustive()
    }
}

impl TrueNasClient {
    /// Create a new TrueNAS client
    ///
    /// # Arguments
    /// * `host` - TrueNAS host name or address, optionally with a port
    /// * `api_key` - API key created under Credentials > API Keys
    /// * `verify_tls` - Verify the server certificate (off for self-signed appliances)
    ///
    /// No connection is made until the first call.
    pub fn new(host: impl Into<String>, api_key: impl Into<String>, verify_tls: bool) -> Self {
        let host = host.into();
        let host = host
            .trim_start_matches("https://")
            .trim_start_matches("wss://")
            .trim_end_matches('/')
            .to_string();
        Self {
            url: format!("wss://{host}/api/current"),
            host,
            api_key: api_key.into(),
            verify_tls,
            timeout: Duration::from_secs(60),
            job_timeout: Duration::from_secs(300),
            session: Mutex::new(None),
        }
    }

    /// Override the per-call and per-job timeouts
    #[must_use]
    pub fn with_timeouts(mut self, call: Duration, job: Duration) -> Self {
        self.timeout = call;
        self.job_timeout = job;
        self
    }

    fn connector(&self) -> Result<Option<Connector>, TrueNasError> {
        if self.verify_tls {
            return Ok(None);
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();
        Ok(Some(Connector::Rustls(Arc::new(config))))
    }

    async fn connect(&self) -> Result<Socket, TrueNasError> {
        debug!("Connecting to TrueNAS at {}", self.url);
        let (mut socket, _) =
            tokio_tungstenite::connect_async_tls_with_config(self.url.as_str(), None, false, self.connector()?)
                .await?;

        let authenticated = Self::exchange(
            &mut socket,
            "auth.login_with_api_key",
            json!([self.api_key]),
            self.timeout,
        )
        .await?;
        if authenticated != Value::Bool(true) {
            return Err(TrueNasError::Authentication(format!(
                "API key rejected by {}",
                self.host
            )));
        }
        info!("Authenticated to TrueNAS at {}", self.host);
        Ok(socket)
    }

    /// Send one request and wait for its response, skipping notifications
    async fn exchange(
        socket: &mut Socket,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TrueNasError> {
        let request = RpcRequest::new(method, params);
        let request_id = request.id.clone();
        socket.send(Message::Text(serde_json::to_string(&request)?)).await?;

        let read = async {
            while let Some(frame) = socket.next().await {
                let text = match frame? {
                    Message::Text(text) => text,
                    Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Message::Close(_) => return Err(TrueNasError::ConnectionClosed),
                    _ => continue,
                };
                let response: RpcResponse = serde_json::from_str(&text)?;
                if response.answers(&request_id) {
                    return response.into_result(method);
                }
            }
            Err(TrueNasError::ConnectionClosed)
        };

        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_elapsed| TrueNasError::Timeout(method.to_string()))?
    }

    /// Call a middleware method
    ///
    /// Reconnects lazily; a transport failure drops the session so the next
    /// call starts fresh.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TrueNasError> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.connect().await?);
        }
        let Some(socket) = session.as_mut() else {
            return Err(TrueNasError::ConnectionClosed);
        };

        debug!("TrueNAS call {}", method);
        let result = Self::exchange(socket, method, params, self.timeout).await;
        if let Err(e) = &result {
            if e.is_transport() {
                warn!("Dropping TrueNAS session after {}: {}", method, e);
                *session = None;
            }
        }
        result
    }

    /// Call a method that may run as a background job and wait for the job
    async fn call_job(&self, method: &str, params: Value) -> Result<Value, TrueNasError> {
        match self.call(method, params).await? {
            Value::Number(id) => match id.as_u64() {
                Some(job_id) => self.wait_for_job(method, job_id).await,
                None => Ok(Value::Number(id)),
            },
            other => Ok(other),
        }
    }

    async fn wait_for_job(&self, method: &str, job_id: u64) -> Result<Value, TrueNasError> {
        let deadline = Instant::now() + self.job_timeout;
        loop {
            let jobs: Vec<Job> =
                serde_json::from_value(self.call("core.get_jobs", json!([[["id", "=", job_id]]])).await?)?;
            let Some(job) = jobs.into_iter().next() else {
                return Err(TrueNasError::NotFound(format!("job {job_id} for {method}")));
            };
            match job.state {
                JobState::Success => return Ok(job.result),
                JobState::Failed | JobState::Aborted => {
                    return Err(TrueNasError::Job {
                        method: method.to_string(),
                        id: job_id,
                        message: job.error.unwrap_or_else(|| format!("{:?}", job.state)),
                    });
                }
                JobState::Waiting | JobState::Running => {}
            }
            if Instant::now() >= deadline {
                return Err(TrueNasError::Timeout(format!("{method} job {job_id}")));
            }
            debug!("Waiting for {} job {} ({:?})", method, job_id, job.state);
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }

    async fn query<T: serde::de::DeserializeOwned>(&self, method: &str, filters: Value) -> Result<Vec<T>, TrueNasError> {
        let result = self.call(method, json!([filters])).await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait::async_trait]
impl TrueNasClientTrait for TrueNasClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn query_vm(&self, name: &str) -> Result<Option<VmRecord>, TrueNasError> {
        let vms: Vec<VmRecord> = self.query("vm.query", json!([["name", "=", name]])).await?;
        Ok(vms.into_iter().next())
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>, TrueNasError> {
        self.query("vm.query", json!([])).await
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmRecord, TrueNasError> {
        let result = self.call("vm.create", json!([request])).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn delete_vm(&self, id: u64) -> Result<(), TrueNasError> {
        self.call_job("vm.delete", json!([id, {"zvols": false, "force": true}]))
            .await?;
        Ok(())
    }

    async fn start_vm(&self, id: u64) -> Result<(), TrueNasError> {
        self.call_job("vm.start", json!([id])).await?;
        Ok(())
    }

    async fn stop_vm(&self, id: u64, force: bool) -> Result<(), TrueNasError> {
        self.call_job("vm.stop", json!([id, {"force": force, "force_after_timeout": true}]))
            .await?;
        Ok(())
    }

    async fn query_devices(&self, vm_id: u64) -> Result<Vec<DeviceRecord>, TrueNasError> {
        self.query("vm.device.query", json!([["vm", "=", vm_id]])).await
    }

    async fn create_device(&self, request: &CreateDeviceRequest) -> Result<DeviceRecord, TrueNasError> {
        let result = self.call("vm.device.create", json!([request])).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_dataset(&self, path: &str) -> Result<Option<Dataset>, TrueNasError> {
        let datasets: Vec<Dataset> = self.query("pool.dataset.query", json!([["id", "=", path]])).await?;
        Ok(datasets.into_iter().next())
    }

    async fn query_datasets(&self, kind: Option<DatasetType>) -> Result<Vec<Dataset>, TrueNasError> {
        let filters = match kind {
            Some(kind) => json!([["type", "=", kind]]),
            None => json!([]),
        };
        self.query("pool.dataset.query", filters).await
    }

    async fn create_dataset(&self, request: &CreateDatasetRequest) -> Result<Dataset, TrueNasError> {
        let result = self.call("pool.dataset.create", json!([request])).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn delete_dataset(&self, path: &str, recursive: bool, force: bool) -> Result<(), TrueNasError> {
        self.call_job(
            "pool.dataset.delete",
            json!([path, {"recursive": recursive, "force": force}]),
        )
        .await?;
        Ok(())
    }
}

/// Certificate verifier for appliances with self-signed certificates.
///
/// Handshake signatures are still checked; only the chain of trust is skipped.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_from_host() {
        let client = TrueNasClient::new("https://nas.lab.local/", "key", false);
        assert_eq!(client.host(), "nas.lab.local");
        assert_eq!(client.url, "wss://nas.lab.local/api/current");
    }

    #[test]
    fn test_insecure_connector_builds() {
        let client = TrueNasClient::new("nas.lab.local", "key", false);
        assert!(matches!(client.connector(), Ok(Some(Connector::Rustls(_)))));

        let verified = TrueNasClient::new("nas.lab.local", "key", true);
        assert!(matches!(verified.connector(), Ok(None)));
    }
}
