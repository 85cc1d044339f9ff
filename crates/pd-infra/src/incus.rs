use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use minijinja::{Environment, context};
use tracing::{info, warn};

use incus_api::{self as api, IncusClient};

use crate::config::ClusterConfig;
use crate::types::{
    InstanceRecord, LaunchPlan, NetworkInfo, PowerAction, RecoveryInfo, User, UserInfo,
};
use crate::{BackupBackend, Error, InstanceBackend, Result};

const ADDRESS_FAMILY_INET: &str = "inet";
const USER_NAME_KEY: &str = "user.name";
const USER_EMAIL_KEY: &str = "user.email";
const CLOUD_INIT_NETWORK_CONFIG: &str = "cloud-init.network-config";
const CLOUD_INIT_USER_DATA: &str = "cloud-init.user-data";
const INSTANCE_TYPE_CONTAINER: &str = "container";

const TEMPLATE_NETWORK_CONFIG: &str = "network-config";
const TEMPLATE_USER_DATA: &str = "user-data";

/// Compute backend talking to an Incus cluster.
///
/// Owns the cluster configuration and the cloud-init template set;
/// everything else is derived per call from live API state.
pub struct IncusBackend {
    client: IncusClient,
    cluster: ClusterConfig,
    templates: Environment<'static>,
}

impl IncusBackend {
    pub fn new(client: IncusClient, cluster: ClusterConfig) -> Result<Self> {
        let mut templates = Environment::new();
        templates.add_template(
            TEMPLATE_NETWORK_CONFIG,
            include_str!("../templates/incus/network-config.yaml.j2"),
        )?;
        templates.add_template(
            TEMPLATE_USER_DATA,
            include_str!("../templates/incus/user-data.yaml.j2"),
        )?;

        Ok(Self {
            client,
            cluster,
            templates,
        })
    }

    /// IPv4 address of the cluster NIC, if the instance has one yet.
    fn instance_ipv4(state: &api::InstanceState, nic: &str) -> Option<Ipv4Addr> {
        state
            .network
            .get(nic)?
            .addresses
            .iter()
            .find(|a| a.family == ADDRESS_FAMILY_INET)
            .and_then(|a| a.address.parse().ok())
    }

    fn record_from(&self, full: &api::InstanceFull) -> InstanceRecord {
        let network = full
            .state
            .as_ref()
            .and_then(|state| Self::instance_ipv4(state, &self.cluster.network.nic))
            .map(NetworkInfo::from_ip);

        InstanceRecord {
            name: full.instance.name.clone(),
            location: Some(full.instance.location.clone()).filter(|l| !l.is_empty()),
            user: UserInfo {
                name: full
                    .instance
                    .config
                    .get(USER_NAME_KEY)
                    .cloned()
                    .unwrap_or_default(),
                email: full
                    .instance
                    .config
                    .get(USER_EMAIL_KEY)
                    .cloned()
                    .unwrap_or_default(),
            },
            network,
        }
    }

    fn render_network_config(&self, network: NetworkInfo) -> Result<String> {
        let net = &self.cluster.network;
        let rendered = self.templates.get_template(TEMPLATE_NETWORK_CONFIG)?.render(context! {
            nic => net.nic,
            ip => network.ip.to_string(),
            prefix_len => net.cidr.prefix_len(),
            gateway => net.gateway.to_string(),
            nameservers => net.nameservers.iter().map(|ns| ns.to_string()).collect::<Vec<_>>(),
        })?;
        Ok(rendered)
    }

    fn render_user_data(&self, user: &User) -> Result<String> {
        let rendered = self.templates.get_template(TEMPLATE_USER_DATA)?.render(context! {
            name => user.name,
            email => user.email,
            public_key => user.public_key,
        })?;
        Ok(rendered)
    }

    async fn set_state(&self, name: &str, action: PowerAction) -> Result<()> {
        let op = self
            .client
            .update_instance_state(name, action.as_str())
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::NotFound(name.to_string())
                } else {
                    Error::Api(e)
                }
            })?;
        self.client.wait_operation(&op).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceBackend for IncusBackend {
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        let instances = self.client.instances_full().await?;
        Ok(instances.iter().map(|full| self.record_from(full)).collect())
    }

    async fn instance_address(&self, name: &str) -> Result<Ipv4Addr> {
        let state = self.client.instance_state(name).await.map_err(|e| {
            if e.is_not_found() {
                Error::NotFound(name.to_string())
            } else {
                Error::Api(e)
            }
        })?;

        Self::instance_ipv4(&state, &self.cluster.network.nic)
            .ok_or_else(|| Error::NoAddress(name.to_string()))
    }

    async fn create_instance(&self, plan: &LaunchPlan) -> Result<()> {
        let flavor = self
            .cluster
            .flavor(&plan.instance.resources.flavor)
            .ok_or_else(|| Error::UnknownFlavor(plan.instance.resources.flavor.clone()))?;

        let net = &self.cluster.network;

        let mut config = HashMap::new();
        config.insert(USER_NAME_KEY.into(), plan.instance.user.name.clone());
        config.insert(USER_EMAIL_KEY.into(), plan.instance.user.email.clone());
        config.insert(
            CLOUD_INIT_NETWORK_CONFIG.into(),
            self.render_network_config(plan.network)?,
        );
        config.insert(
            CLOUD_INIT_USER_DATA.into(),
            self.render_user_data(&plan.instance.user)?,
        );
        config.insert("limits.cpu".into(), flavor.cpu.to_string());
        config.insert("limits.memory".into(), format!("{}GiB", flavor.memory));

        let mut devices = HashMap::new();
        devices.insert(
            net.nic.clone(),
            HashMap::from([
                ("type".into(), "nic".into()),
                ("nictype".into(), "bridged".into()),
                ("name".into(), net.nic.clone()),
                ("parent".into(), net.bridge.clone()),
            ]),
        );
        devices.insert(
            "root".into(),
            HashMap::from([
                ("type".into(), "disk".into()),
                ("path".into(), "/".into()),
                ("pool".into(), self.cluster.storage.pool.clone()),
                ("size".into(), format!("{}GiB", plan.instance.resources.disk)),
            ]),
        );

        // The operation is left running; the instance boots in the
        // background while the engine moves on.
        let _op = self
            .client
            .create_instance(&api::InstancesPost {
                name: plan.instance.name.clone(),
                source: api::InstanceSource {
                    kind: "image".into(),
                    alias: Some(self.cluster.image.clone()),
                },
                kind: INSTANCE_TYPE_CONTAINER.into(),
                start: true,
                config,
                devices,
            })
            .await?;

        info!(name = %plan.instance.name, ip = %plan.network.ip, "incus: instance launch started");
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        match self.set_state(name, PowerAction::Stop).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                warn!(name, "incus: instance already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match self.client.delete_instance(name).await? {
            Some(op) => {
                self.client.wait_operation(&op).await?;
                info!(name, "incus: instance deleted");
            }
            None => warn!(name, "incus: instance already deleted"),
        }

        Ok(())
    }
}

#[async_trait]
impl BackupBackend for IncusBackend {
    async fn update_instance_state(&self, name: &str, action: PowerAction) -> Result<()> {
        self.set_state(name, action).await
    }

    async fn create_snapshot(&self, name: &str) -> Result<String> {
        let snapshot = format!("{name}-snapshot");
        let op = self.client.create_snapshot(name, &snapshot).await?;
        self.client.wait_operation(&op).await?;
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let op = self.client.delete_snapshot(name, snapshot).await?;
        self.client.wait_operation(&op).await?;
        Ok(())
    }

    async fn create_image_from_snapshot(&self, name: &str, snapshot: &str) -> Result<String> {
        let op = self
            .client
            .create_image(&api::ImagesPost {
                source: api::ImagesPostSource {
                    kind: "snapshot".into(),
                    name: format!("{name}/{snapshot}"),
                },
                aliases: vec![api::ImageAlias {
                    name: format!("{name}-backup"),
                }],
            })
            .await?;

        let operation = self.client.wait_operation(&op).await?;

        operation
            .metadata
            .as_ref()
            .and_then(|m| m.get("fingerprint"))
            .and_then(|f| f.as_str())
            .map(str::to_string)
            .ok_or(Error::MissingFingerprint)
    }

    async fn export_image(&self, fingerprint: &str) -> Result<Vec<u8>> {
        Ok(self.client.export_image(fingerprint).await?)
    }

    async fn delete_image(&self, fingerprint: &str) -> Result<()> {
        let op = self.client.delete_image(fingerprint).await?;
        self.client.wait_operation(&op).await?;
        Ok(())
    }

    async fn recovery_info(&self, name: &str) -> Result<RecoveryInfo> {
        let instance = self.client.instance(name).await.map_err(|e| {
            if e.is_not_found() {
                Error::NotFound(name.to_string())
            } else {
                Error::Api(e)
            }
        })?;

        Ok(RecoveryInfo {
            config: instance.config,
            devices: instance.devices,
        })
    }

    async fn cluster_members(&self) -> Result<Vec<String>> {
        let members = self.client.cluster_members().await?;
        Ok(members.into_iter().map(|m| m.server_name).collect())
    }
}
