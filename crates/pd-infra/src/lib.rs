pub mod config;
pub mod exec;
pub mod incus;
pub mod mail;
pub mod notify;
pub mod types;

use std::net::Ipv4Addr;

use async_trait::async_trait;

use types::{InstanceRecord, LaunchPlan, PowerAction, RecoveryInfo};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("instance '{0}' has no address on the cluster network")]
    NoAddress(String),

    #[error("incus api error: {0}")]
    Api(#[source] incus_api::Error),

    #[error("unknown flavor: {0}")]
    UnknownFlavor(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("invalid mail relay address: {0}")]
    MailRelay(String),

    #[error("invalid mail address: {0}")]
    MailAddress(#[from] lettre::address::AddressError),

    #[error("invalid mail message: {0}")]
    MailMessage(#[from] lettre::error::Error),

    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("image publish returned no fingerprint")]
    MissingFingerprint,

    #[error("command '{command}' exited with {status}")]
    Command { command: String, status: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<incus_api::Error> for Error {
    fn from(e: incus_api::Error) -> Self {
        Error::Api(e)
    }
}

impl Error {
    /// Whether this error means the instance's address cannot be known,
    /// as opposed to the backend having failed. Callers resolving
    /// addresses for deletion targets treat these as "address unknown"
    /// rather than fatal.
    pub fn leaves_address_unknown(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::NoAddress(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Backend surface consumed by the reconciliation engine.
///
/// All calls are suspension points and may fail independently; failures
/// are wrapped with context by the caller, never interpreted.
#[async_trait]
pub trait InstanceBackend: Send + Sync + 'static {
    /// All instances currently known to the backend.
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>>;

    /// Current IPv4 address of one instance on the cluster network.
    async fn instance_address(&self, name: &str) -> Result<Ipv4Addr>;

    /// Create and start an instance. The backend finishes the launch in
    /// the background.
    async fn create_instance(&self, plan: &LaunchPlan) -> Result<()>;

    /// Stop and remove an instance. Removing an instance that is
    /// already gone is not an error.
    async fn delete_instance(&self, name: &str) -> Result<()>;
}

/// Additional backend surface consumed by the backup pipeline.
#[async_trait]
pub trait BackupBackend: InstanceBackend {
    async fn update_instance_state(&self, name: &str, action: PowerAction) -> Result<()>;

    /// Snapshot an instance, returning the snapshot name.
    async fn create_snapshot(&self, name: &str) -> Result<String>;

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    /// Publish an image from a snapshot, returning the image fingerprint.
    async fn create_image_from_snapshot(&self, name: &str, snapshot: &str) -> Result<String>;

    /// Download an exported image as a tarball.
    async fn export_image(&self, fingerprint: &str) -> Result<Vec<u8>>;

    async fn delete_image(&self, fingerprint: &str) -> Result<()>;

    /// Config and device maps needed to re-import an instance.
    async fn recovery_info(&self, name: &str) -> Result<RecoveryInfo>;

    /// Names of all cluster members.
    async fn cluster_members(&self) -> Result<Vec<String>>;
}
