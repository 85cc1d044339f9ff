use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::info;

use pd_infra::BackupBackend;
use pd_infra::exec::CommandRunner;
use pd_infra::types::PowerAction;

pub const INSTANCE_ARCHIVE: &str = "instance.tar.gz";
pub const CONFIG_BACKUP: &str = "config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Infra(#[from] pd_infra::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize recovery config: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Backs up every instance located on this host, one at a time.
///
/// Per instance: snapshot while briefly stopped, publish the snapshot
/// as an image, export the image next to a YAML copy of the instance's
/// config, ship the directory to the other cluster members with rsync,
/// then remove the local copy. Reuses the backend client but none of
/// the reconciliation engine's diffing or fan-out.
pub struct BackupRunner {
    backend: Arc<dyn BackupBackend>,
    runner: Arc<dyn CommandRunner>,
    hostname: String,
    directory: PathBuf,
}

impl BackupRunner {
    pub fn new(
        backend: Arc<dyn BackupBackend>,
        runner: Arc<dyn CommandRunner>,
        hostname: impl Into<String>,
        directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            runner,
            hostname: hostname.into(),
            directory: directory.into(),
        }
    }

    /// Back up all local instances, returning how many were processed.
    pub async fn run(&self) -> Result<usize, BackupError> {
        let instances = self.backend.list_instances().await?;
        let members = self.backend.cluster_members().await?;

        let mut backed_up = 0;
        for record in &instances {
            if record.location.as_deref() != Some(self.hostname.as_str()) {
                continue;
            }

            self.backup_instance(&record.name, &members).await?;
            backed_up += 1;
        }

        Ok(backed_up)
    }

    async fn backup_instance(&self, name: &str, members: &[String]) -> Result<(), BackupError> {
        let directory = self.directory.join(name);
        fs::create_dir_all(&directory)
            .await
            .map_err(|source| BackupError::Write {
                path: directory.clone(),
                source,
            })?;

        self.export_archive(name, &directory.join(INSTANCE_ARCHIVE))
            .await?;
        self.write_recovery_config(name, &directory.join(CONFIG_BACKUP))
            .await?;
        self.replicate(&directory, members).await?;

        fs::remove_dir_all(&directory)
            .await
            .map_err(|source| BackupError::Write {
                path: directory.clone(),
                source,
            })?;

        info!(name, "instance backed up");
        Ok(())
    }

    /// Snapshot the instance while it is briefly stopped, publish the
    /// snapshot as an image, and export that image to `path`.
    async fn export_archive(&self, name: &str, path: &Path) -> Result<(), BackupError> {
        self.backend
            .update_instance_state(name, PowerAction::Stop)
            .await?;
        let snapshot = self.backend.create_snapshot(name).await?;
        self.backend
            .update_instance_state(name, PowerAction::Start)
            .await?;

        let fingerprint = self
            .backend
            .create_image_from_snapshot(name, &snapshot)
            .await?;
        self.backend.delete_snapshot(name, &snapshot).await?;

        let archive = self.backend.export_image(&fingerprint).await?;
        fs::write(path, archive)
            .await
            .map_err(|source| BackupError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        self.backend.delete_image(&fingerprint).await?;
        Ok(())
    }

    async fn write_recovery_config(&self, name: &str, path: &Path) -> Result<(), BackupError> {
        let recovery = self.backend.recovery_info(name).await?;
        let data = serde_yaml::to_string(&recovery)?;

        fs::write(path, data)
            .await
            .map_err(|source| BackupError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(())
    }

    /// Ship the backup directory to every other cluster member.
    async fn replicate(&self, directory: &Path, members: &[String]) -> Result<(), BackupError> {
        let local = format!("{}/", directory.display());

        for member in members {
            if *member == self.hostname {
                continue;
            }

            let args = vec![
                "-r".to_string(),
                "--mkpath".to_string(),
                local.clone(),
                format!("{member}:{local}"),
            ];
            self.runner.run("rsync", &args).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pd_infra::types::{InstanceRecord, LaunchPlan, RecoveryInfo, UserInfo};
    use pd_infra::{InstanceBackend, Result as InfraResult};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    struct FakeBackend {
        observed: Vec<InstanceRecord>,
        members: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new(observed: Vec<InstanceRecord>, members: Vec<String>) -> Self {
            Self {
                observed,
                members,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl InstanceBackend for FakeBackend {
        async fn list_instances(&self) -> InfraResult<Vec<InstanceRecord>> {
            Ok(self.observed.clone())
        }

        async fn instance_address(&self, name: &str) -> InfraResult<Ipv4Addr> {
            Err(pd_infra::Error::NotFound(name.to_string()))
        }

        async fn create_instance(&self, _plan: &LaunchPlan) -> InfraResult<()> {
            unreachable!("backup never creates instances")
        }

        async fn delete_instance(&self, _name: &str) -> InfraResult<()> {
            unreachable!("backup never deletes instances")
        }
    }

    #[async_trait]
    impl BackupBackend for FakeBackend {
        async fn update_instance_state(&self, name: &str, action: PowerAction) -> InfraResult<()> {
            self.log(format!("{} {name}", action.as_str()));
            Ok(())
        }

        async fn create_snapshot(&self, name: &str) -> InfraResult<String> {
            self.log(format!("snapshot {name}"));
            Ok(format!("{name}-snapshot"))
        }

        async fn delete_snapshot(&self, name: &str, snapshot: &str) -> InfraResult<()> {
            self.log(format!("delete-snapshot {name} {snapshot}"));
            Ok(())
        }

        async fn create_image_from_snapshot(
            &self,
            name: &str,
            snapshot: &str,
        ) -> InfraResult<String> {
            self.log(format!("image {name} {snapshot}"));
            Ok("cafebabe".to_string())
        }

        async fn export_image(&self, fingerprint: &str) -> InfraResult<Vec<u8>> {
            self.log(format!("export {fingerprint}"));
            Ok(b"tarball".to_vec())
        }

        async fn delete_image(&self, fingerprint: &str) -> InfraResult<()> {
            self.log(format!("delete-image {fingerprint}"));
            Ok(())
        }

        async fn recovery_info(&self, name: &str) -> InfraResult<RecoveryInfo> {
            self.log(format!("recovery {name}"));
            Ok(RecoveryInfo {
                config: HashMap::from([("user.name".to_string(), "ada".to_string())]),
                devices: HashMap::new(),
            })
        }

        async fn cluster_members(&self) -> InfraResult<Vec<String>> {
            Ok(self.members.clone())
        }
    }

    #[derive(Default)]
    struct FakeRunner {
        commands: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, program: &str, args: &[String]) -> InfraResult<()> {
            self.commands
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            Ok(())
        }
    }

    fn local_instance(name: &str, location: &str) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            location: Some(location.to_string()),
            user: UserInfo {
                name: "ada".into(),
                email: "ada@example.org".into(),
            },
            network: None,
        }
    }

    #[tokio::test]
    async fn backs_up_only_instances_on_this_host() {
        let backend = Arc::new(FakeBackend::new(
            vec![
                local_instance("u1", "host1"),
                local_instance("u2", "host2"),
            ],
            vec!["host1".into(), "host2".into()],
        ));
        let runner = Arc::new(FakeRunner::default());
        let dir = tempfile::tempdir().unwrap();

        let backup = BackupRunner::new(
            Arc::clone(&backend) as Arc<dyn BackupBackend>,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "host1",
            dir.path(),
        );

        let count = backup.run().await.unwrap();

        assert_eq!(count, 1);

        // Snapshot taken while the instance was stopped, image
        // published and cleaned up afterwards.
        let calls = backend.calls.lock().unwrap();
        assert_eq!(
            *calls,
            [
                "stop u1",
                "snapshot u1",
                "start u1",
                "image u1 u1-snapshot",
                "delete-snapshot u1 u1-snapshot",
                "export cafebabe",
                "delete-image cafebabe",
                "recovery u1",
            ]
            .map(String::from)
        );

        // Shipped to the other member only, then removed locally.
        let commands = runner.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, "rsync");
        assert!(commands[0].1.last().unwrap().starts_with("host2:"));
        assert!(!dir.path().join("u1").exists());
    }

    #[tokio::test]
    async fn no_local_instances_means_no_work() {
        let backend = Arc::new(FakeBackend::new(
            vec![local_instance("u1", "elsewhere")],
            vec!["host1".into()],
        ));
        let runner = Arc::new(FakeRunner::default());
        let dir = tempfile::tempdir().unwrap();

        let backup = BackupRunner::new(
            Arc::clone(&backend) as Arc<dyn BackupBackend>,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "host1",
            dir.path(),
        );

        let count = backup.run().await.unwrap();

        assert_eq!(count, 0);
        assert!(backend.calls.lock().unwrap().is_empty());
        assert!(runner.commands.lock().unwrap().is_empty());
    }
}
