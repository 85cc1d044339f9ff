use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Response envelope ────────────────────────────────────────────────

/// Every Incus endpoint wraps its payload in this envelope. `sync`
/// responses carry the payload in `metadata`; `async` responses carry an
/// operation path in `operation`; `error` responses carry `error_code`
/// and `error`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub operation: Option<String>,
    pub metadata: Option<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Sync,
    Async,
    Error,
}

/// A background operation record, as returned by the operations API.
#[derive(Debug, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    pub metadata: Option<serde_json::Value>,
}

// ── Instance types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
}

/// Instance plus runtime state, from `GET /1.0/instances?recursion=2`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceFull {
    #[serde(flatten)]
    pub instance: Instance,
    pub state: Option<InstanceState>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceState {
    pub status: String,
    #[serde(default)]
    pub network: HashMap<String, InstanceStateNetwork>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceStateNetwork {
    #[serde(default)]
    pub addresses: Vec<InstanceStateAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceStateAddress {
    pub family: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstancesPost {
    pub name: String,
    pub source: InstanceSource,
    #[serde(rename = "type")]
    pub kind: String,
    pub start: bool,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatePut {
    pub action: String,
    pub timeout: i64,
    pub force: bool,
}

// ── Snapshot and image types ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotsPost {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagesPost {
    pub source: ImagesPostSource,
    pub aliases: Vec<ImageAlias>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagesPostSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageAlias {
    pub name: String,
}

// ── Cluster types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterMember {
    pub server_name: String,
    #[serde(default)]
    pub status: String,
}
