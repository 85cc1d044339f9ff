use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use serde::Deserialize;

/// Cluster-wide configuration, loaded once from the operator's cluster
/// file and passed by value into the components that need it. There is
/// no process-wide settings state.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Image alias instances are created from.
    pub image: String,
    /// Public DNS name users connect through.
    pub domain: String,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub network: NetworkConfig,
    pub mail: MailConfig,
    pub flavors: Vec<Flavor>,
}

impl ClusterConfig {
    pub fn flavor(&self, name: &str) -> Option<&Flavor> {
        self.flavors.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Incus API endpoint, e.g. `https://127.0.0.1:8443`.
    pub endpoint: String,
    /// PEM bundle with the client certificate and key Incus trusts.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    /// Accept the cluster's self-signed server certificate.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub pool: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub bridge: String,
    pub nic: String,
    pub cidr: Ipv4Net,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
    /// Addresses never handed to instances (gateway, infra services).
    #[serde(default)]
    pub reserved: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// SMTP relay, `host[:port]`.
    pub server: String,
}

/// A named resource sizing preset selectable per instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub cpu: u32,
    /// Memory limit in GiB.
    pub memory: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
image: ubuntu/24.04
domain: cloud.example.org
api:
  endpoint: https://127.0.0.1:8443
  accept_invalid_certs: true
storage:
  pool: default
backup:
  dir: /var/backups/paddock
network:
  bridge: br0
  nic: eth0
  cidr: 10.96.17.0/24
  gateway: 10.96.17.1
  nameservers: [10.96.17.1]
  reserved: [10.96.17.1, 10.96.17.2]
mail:
  server: mail.example.org:25
flavors:
  - name: micro
    cpu: 1
    memory: 1
"#;

    #[test]
    fn parses_cluster_file() {
        let config: ClusterConfig = serde_yaml::from_str(SAMPLE).unwrap();

        assert_eq!(config.network.cidr.to_string(), "10.96.17.0/24");
        assert_eq!(config.network.reserved.len(), 2);
        assert_eq!(config.flavor("micro").unwrap().cpu, 1);
        assert!(config.flavor("huge").is_none());
        assert!(config.api.client_cert.is_none());
    }
}
