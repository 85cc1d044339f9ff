use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

/// Base of the forwarding port range. Each instance is reachable from
/// outside on `FORWARD_PORT_BASE + last octet` of its address.
pub const FORWARD_PORT_BASE: u16 = 62000;

/// Forwarding port for an instance address. Pure: two instances in the
/// same /24 always get distinct ports, and the last octet can be read
/// back off the port for diagnostics.
pub fn forward_port(ip: Ipv4Addr) -> u16 {
    FORWARD_PORT_BASE + u16::from(ip.octets()[3])
}

/// A declared instance, as read from the operator's instance files.
/// Uniquely keyed by `name`; the engine assumes the set was validated
/// upstream and contains no duplicates.
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    pub resources: InstanceResources,
    pub user: User,
    #[serde(rename = "expires", with = "expiry_date")]
    pub expires_at: DateTime<Utc>,
}

impl Instance {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceResources {
    pub flavor: String,
    /// Root disk size in GiB.
    pub disk: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub name: String,
    pub email: String,
    pub public_key: String,
}

/// User identity carried on observed instances and apply results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub name: String,
    pub email: String,
}

/// Address assignment for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl NetworkInfo {
    pub fn from_ip(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            port: forward_port(ip),
        }
    }
}

/// An instance as observed on the backend. `network` is absent until
/// the instance is reachable on the cluster network; `location` is
/// absent for records assembled before the scheduler placed the
/// instance on a host.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub user: UserInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
}

/// Materialized intent to create one instance. Owned by exactly one
/// launch task for its lifetime.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub instance: Instance,
    pub network: NetworkInfo,
}

/// Config and device maps backed up alongside an instance image so the
/// instance can be re-imported by hand.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryInfo {
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
}

/// Power actions understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Expiry dates are written `DD-MM-YYYY` in instance files and stand
/// for midnight UTC of that day.
mod expiry_date {
    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
    use serde::{Deserialize, Deserializer};

    const FORMAT: &str = "%d-%m-%Y";

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let date = NaiveDate::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)?;
        Ok(date.and_time(NaiveTime::MIN).and_utc())
    }
}
