//! Typed Rust client for the Incus REST API.
//!
//! Covers the subset needed for managing cluster instances:
//! instances (list, create, delete, state), snapshots, images, and
//! cluster members. Mutating endpoints are asynchronous on the Incus
//! side and return an operation handle which can be awaited with
//! [`IncusClient::wait_operation`].

mod types;

pub use types::*;

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("incus api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("incus api {endpoint} returned {code}: {message}")]
    Api {
        endpoint: &'static str,
        code: u16,
        message: String,
    },

    #[error("incus operation {id} failed: {message}")]
    Operation { id: String, message: String },

    #[error("incus api {0} response had no payload")]
    EmptyResponse(&'static str),
}

impl Error {
    /// Whether this error is the server saying the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { code: 404, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle for a background Incus operation, to be passed to
/// [`IncusClient::wait_operation`].
#[derive(Debug, Clone)]
pub struct OperationRef(String);

/// Connection settings for [`IncusClient`].
///
/// Incus trusts clients by TLS certificate, so `client_cert_pem` should
/// hold a PEM bundle with both the certificate and its private key.
/// Cluster certificates are commonly self-signed, hence
/// `accept_invalid_certs`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub endpoint: String,
    pub client_cert_pem: Option<Vec<u8>>,
    pub accept_invalid_certs: bool,
}

/// Client for the Incus REST API.
#[derive(Clone)]
pub struct IncusClient {
    base_url: String,
    http: reqwest::Client,
}

impl IncusClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if let Some(pem) = &config.client_cert_pem {
            builder = builder.identity(reqwest::Identity::from_pem(pem)?);
        }
        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            http: builder.build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        endpoint: &'static str,
    ) -> Result<Envelope<T>> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|_| Error::Api {
            endpoint,
            code: status.as_u16(),
            message: body,
        })?;

        if envelope.kind == ResponseKind::Error {
            return Err(Error::Api {
                endpoint,
                code: envelope.error_code,
                message: envelope.error,
            });
        }

        Ok(envelope)
    }

    async fn get_metadata<T: DeserializeOwned>(
        &self,
        path: &str,
        endpoint: &'static str,
    ) -> Result<T> {
        let envelope = self
            .send::<T>(self.http.get(self.url(path)), endpoint)
            .await?;
        envelope.metadata.ok_or(Error::EmptyResponse(endpoint))
    }

    async fn start_operation<B: Serialize + ?Sized>(
        &self,
        req: reqwest::RequestBuilder,
        body: Option<&B>,
        endpoint: &'static str,
    ) -> Result<OperationRef> {
        let req = match body {
            Some(body) => req.json(body),
            None => req,
        };
        let envelope = self.send::<serde_json::Value>(req, endpoint).await?;
        envelope
            .operation
            .filter(|op| !op.is_empty())
            .map(OperationRef)
            .ok_or(Error::EmptyResponse(endpoint))
    }

    /// Block until a background operation settles, returning its final record.
    pub async fn wait_operation(&self, op: &OperationRef) -> Result<Operation> {
        let path = format!("{}/wait", op.0);
        let operation: Operation = self.get_metadata(&path, "wait operation").await?;

        if operation.status_code >= 400 {
            return Err(Error::Operation {
                id: operation.id,
                message: operation.err,
            });
        }

        Ok(operation)
    }

    // ── Instances ────────────────────────────────────────────────────

    pub async fn instances_full(&self) -> Result<Vec<InstanceFull>> {
        self.get_metadata("/1.0/instances?recursion=2", "list instances")
            .await
    }

    pub async fn instance(&self, name: &str) -> Result<Instance> {
        self.get_metadata(&format!("/1.0/instances/{name}"), "get instance")
            .await
    }

    pub async fn instance_state(&self, name: &str) -> Result<InstanceState> {
        self.get_metadata(&format!("/1.0/instances/{name}/state"), "get instance state")
            .await
    }

    pub async fn update_instance_state(&self, name: &str, action: &str) -> Result<OperationRef> {
        let body = InstanceStatePut {
            action: action.to_string(),
            timeout: -1,
            force: false,
        };
        self.start_operation(
            self.http
                .put(self.url(&format!("/1.0/instances/{name}/state"))),
            Some(&body),
            "update instance state",
        )
        .await
    }

    pub async fn create_instance(&self, req: &InstancesPost) -> Result<OperationRef> {
        self.start_operation(
            self.http.post(self.url("/1.0/instances")),
            Some(req),
            "create instance",
        )
        .await
    }

    /// Delete an instance. Returns `Ok(None)` if the instance is already
    /// gone (for delete idempotency).
    pub async fn delete_instance(&self, name: &str) -> Result<Option<OperationRef>> {
        let result = self
            .start_operation::<()>(
                self.http
                    .delete(self.url(&format!("/1.0/instances/{name}"))),
                None,
                "delete instance",
            )
            .await;

        match result {
            Ok(op) => Ok(Some(op)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Snapshots ────────────────────────────────────────────────────

    pub async fn create_snapshot(&self, instance: &str, snapshot: &str) -> Result<OperationRef> {
        let body = SnapshotsPost {
            name: snapshot.to_string(),
        };
        self.start_operation(
            self.http
                .post(self.url(&format!("/1.0/instances/{instance}/snapshots"))),
            Some(&body),
            "create snapshot",
        )
        .await
    }

    pub async fn delete_snapshot(&self, instance: &str, snapshot: &str) -> Result<OperationRef> {
        self.start_operation::<()>(
            self.http.delete(
                self.url(&format!("/1.0/instances/{instance}/snapshots/{snapshot}")),
            ),
            None,
            "delete snapshot",
        )
        .await
    }

    // ── Images ───────────────────────────────────────────────────────

    pub async fn create_image(&self, req: &ImagesPost) -> Result<OperationRef> {
        self.start_operation(
            self.http.post(self.url("/1.0/images")),
            Some(req),
            "create image",
        )
        .await
    }

    pub async fn delete_image(&self, fingerprint: &str) -> Result<OperationRef> {
        self.start_operation::<()>(
            self.http
                .delete(self.url(&format!("/1.0/images/{fingerprint}"))),
            None,
            "delete image",
        )
        .await
    }

    /// Download an exported image as raw bytes. Unlike the other
    /// endpoints, export responses are not enveloped.
    pub async fn export_image(&self, fingerprint: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.url(&format!("/1.0/images/{fingerprint}/export")))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint: "export image",
                code: status.as_u16(),
                message: body,
            });
        }

        Ok(resp.bytes().await?.to_vec())
    }

    // ── Cluster ──────────────────────────────────────────────────────

    pub async fn cluster_members(&self) -> Result<Vec<ClusterMember>> {
        self.get_metadata("/1.0/cluster/members?recursion=1", "list cluster members")
            .await
    }
}
