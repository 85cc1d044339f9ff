use std::collections::HashSet;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use ipnet::Ipv4Net;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pd_infra::InstanceBackend;
use pd_infra::mail::MailSender;
use pd_infra::notify::{MailTemplates, TEMPLATE_CREATED, TEMPLATE_DELETED};
use pd_infra::types::{Instance, InstanceRecord, LaunchPlan, NetworkInfo, UserInfo};

use crate::diff::{self, DeletionTarget};
use crate::executor;
use crate::netpool::{self, InsufficientAddresses};

/// Concurrency ceiling for backend and mail traffic within one phase.
/// Bounds load on the shared backend and the mail relay rather than
/// maximizing throughput.
pub const MAX_CONCURRENT_REQUESTS: usize = 3;

pub const SUBJECT_INSTANCE_CREATED: &str = "Your Paddock instance has been created";
pub const SUBJECT_INSTANCE_DELETED: &str = "Your Paddock instance has been deleted";

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to list instances: {0}")]
    ListInstances(#[source] pd_infra::Error),

    #[error("failed to resolve address for instance '{name}': {source}")]
    ResolveAddress {
        name: String,
        #[source]
        source: pd_infra::Error,
    },

    #[error(transparent)]
    InsufficientAddresses(#[from] InsufficientAddresses),

    #[error("delete phase failed: {0}")]
    Delete(#[source] TaskError),

    #[error("launch phase failed: {0}")]
    Launch(#[source] TaskError),
}

/// Failure of a single launch or delete task.
///
/// A task covers the backend mutation and the follow-up notification;
/// either failing fails the task. An instance can therefore be fully
/// provisioned yet reported as a failure because its mail did not send;
/// that is surfaced rather than silently swallowed, and a re-run
/// reconciles from live state.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("backend request failed: {0}")]
    Backend(#[source] pd_infra::Error),

    #[error("failed to render notification: {0}")]
    Render(#[source] pd_infra::Error),

    #[error("failed to send notification: {0}")]
    Mail(#[source] pd_infra::Error),

    #[error("cancelled")]
    Cancelled,
}

/// What one apply changed. Assembled from the engine's own plans and
/// targets, not re-queried from the backend, and never mutated after
/// the call returns.
#[derive(Debug, Default, Serialize)]
pub struct ApplyResult {
    pub launched: Vec<InstanceRecord>,
    pub deleted: Vec<InstanceRecord>,
}

pub struct ReconcilerConfig {
    pub backend: Arc<dyn InstanceBackend>,
    pub mailer: Arc<dyn MailSender>,
    pub templates: Arc<MailTemplates>,
    /// Public DNS name put into "created" notifications.
    pub domain: String,
    /// Cluster network instances get their addresses from.
    pub network: Ipv4Net,
    /// Statically reserved addresses, never handed to instances.
    pub reserved: Vec<Ipv4Addr>,
    pub concurrency: usize,
}

/// Brings the backend into agreement with a declared instance set.
///
/// Holds no state across calls; the backend is re-queried on every
/// apply, which makes a failed run safe to retry wholesale.
pub struct Reconciler {
    backend: Arc<dyn InstanceBackend>,
    mailer: Arc<dyn MailSender>,
    templates: Arc<MailTemplates>,
    domain: String,
    network: Ipv4Net,
    reserved: Vec<Ipv4Addr>,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            backend: config.backend,
            mailer: config.mailer,
            templates: config.templates,
            domain: config.domain,
            network: config.network,
            reserved: config.reserved,
            concurrency: config.concurrency,
        }
    }

    /// Reconcile the backend with `desired`: delete what is undeclared
    /// or expired, then launch what is missing.
    ///
    /// The delete phase runs strictly before the launch phase; a delete
    /// failure aborts the call before any launch is attempted. On any
    /// error the caller gets no partial result; some instances may
    /// have been created or deleted, and a re-run recomputes the diff
    /// from live backend state.
    pub async fn apply(
        &self,
        desired: &[Instance],
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, ApplyError> {
        let observed = self
            .backend
            .list_instances()
            .await
            .map_err(ApplyError::ListInstances)?;

        let outcome = diff::diff(desired, &observed, Utc::now());
        let to_delete = self.resolve_addresses(outcome.to_delete).await?;

        info!(
            desired = desired.len(),
            observed = observed.len(),
            to_launch = outcome.to_launch.len(),
            to_delete = to_delete.len(),
            "computed reconciliation plan"
        );

        self.delete_instances(&to_delete, cancel).await?;

        let launched = self
            .launch_instances(&outcome.to_launch, &observed, cancel)
            .await?;

        let deleted = to_delete
            .into_iter()
            .map(|target| InstanceRecord {
                name: target.name,
                location: None,
                user: target.user,
                network: target.network,
            })
            .collect();

        Ok(ApplyResult { launched, deleted })
    }

    /// Fill in addresses for deletion targets the diff could not
    /// resolve from observed state. A target the backend has no record
    /// of (an expired instance that was never actually created) keeps
    /// an unknown address; deletion tolerates that. Any other lookup
    /// failure is fatal.
    async fn resolve_addresses(
        &self,
        mut targets: Vec<DeletionTarget>,
    ) -> Result<Vec<DeletionTarget>, ApplyError> {
        for target in &mut targets {
            if target.network.is_some() {
                continue;
            }

            match self.backend.instance_address(&target.name).await {
                Ok(ip) => target.network = Some(NetworkInfo::from_ip(ip)),
                Err(e) if e.leaves_address_unknown() => {
                    debug!(name = %target.name, "deletion target has no known address");
                }
                Err(e) => {
                    return Err(ApplyError::ResolveAddress {
                        name: target.name.clone(),
                        source: e,
                    });
                }
            }
        }

        Ok(targets)
    }

    async fn delete_instances(
        &self,
        targets: &[DeletionTarget],
        cancel: &CancellationToken,
    ) -> Result<(), ApplyError> {
        if targets.is_empty() {
            return Ok(());
        }

        // Cancellation is scoped to this phase; a failure here never
        // bleeds into a later apply phase.
        let phase = cancel.child_token();

        let tasks: Vec<_> = targets
            .iter()
            .cloned()
            .map(|target| {
                delete_one(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.mailer),
                    Arc::clone(&self.templates),
                    target,
                    phase.clone(),
                )
            })
            .collect();

        executor::run_all(tasks, self.concurrency, &phase)
            .await
            .map_err(ApplyError::Delete)
    }

    async fn launch_instances(
        &self,
        instances: &[Instance],
        observed: &[InstanceRecord],
        cancel: &CancellationToken,
    ) -> Result<Vec<InstanceRecord>, ApplyError> {
        // No instances to launch must not fail, and must not touch the
        // address pool at all.
        if instances.is_empty() {
            return Ok(Vec::new());
        }

        // Seed the occupied set with every address an observed instance
        // holds, including ones this call just deleted: freed addresses
        // are not reused until a later run observes them gone.
        let mut occupied: HashSet<Ipv4Addr> = self.reserved.iter().copied().collect();
        occupied.extend(observed.iter().filter_map(|r| r.network.map(|n| n.ip)));

        let ips = netpool::allocate(instances.len(), self.network, &occupied)?;

        let plans: Vec<LaunchPlan> = instances
            .iter()
            .cloned()
            .zip(ips)
            .map(|(instance, ip)| LaunchPlan {
                instance,
                network: NetworkInfo::from_ip(ip),
            })
            .collect();

        let launched = plans
            .iter()
            .map(|plan| InstanceRecord {
                name: plan.instance.name.clone(),
                location: None,
                user: UserInfo {
                    name: plan.instance.user.name.clone(),
                    email: plan.instance.user.email.clone(),
                },
                network: Some(plan.network),
            })
            .collect();

        let phase = cancel.child_token();

        let tasks: Vec<_> = plans
            .into_iter()
            .map(|plan| {
                launch_one(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.mailer),
                    Arc::clone(&self.templates),
                    self.domain.clone(),
                    plan,
                    phase.clone(),
                )
            })
            .collect();

        executor::run_all(tasks, self.concurrency, &phase)
            .await
            .map_err(ApplyError::Launch)?;

        Ok(launched)
    }
}

/// Await a collaborator call, giving up at the next opportunity once
/// the phase is cancelled.
async fn guard<F>(cancel: &CancellationToken, fut: F) -> Result<F::Output, TaskError>
where
    F: Future,
{
    match cancel.run_until_cancelled(fut).await {
        Some(output) => Ok(output),
        None => Err(TaskError::Cancelled),
    }
}

async fn delete_one(
    backend: Arc<dyn InstanceBackend>,
    mailer: Arc<dyn MailSender>,
    templates: Arc<MailTemplates>,
    target: DeletionTarget,
    cancel: CancellationToken,
) -> Result<(), TaskError> {
    guard(&cancel, backend.delete_instance(&target.name))
        .await?
        .map_err(TaskError::Backend)?;

    let body = templates
        .render(
            TEMPLATE_DELETED,
            json!({ "name": target.name, "user": target.user.name }),
        )
        .map_err(TaskError::Render)?;

    guard(
        &cancel,
        mailer.send(&target.user.email, SUBJECT_INSTANCE_DELETED, &body),
    )
    .await?
    .map_err(TaskError::Mail)?;

    info!(name = %target.name, reason = ?target.reason, "instance deleted");
    Ok(())
}

async fn launch_one(
    backend: Arc<dyn InstanceBackend>,
    mailer: Arc<dyn MailSender>,
    templates: Arc<MailTemplates>,
    domain: String,
    plan: LaunchPlan,
    cancel: CancellationToken,
) -> Result<(), TaskError> {
    guard(&cancel, backend.create_instance(&plan))
        .await?
        .map_err(TaskError::Backend)?;

    let body = templates
        .render(
            TEMPLATE_CREATED,
            json!({
                "name": plan.instance.name,
                "user": plan.instance.user.name,
                "domain": domain,
                "port": plan.network.port,
            }),
        )
        .map_err(TaskError::Render)?;

    guard(
        &cancel,
        mailer.send(&plan.instance.user.email, SUBJECT_INSTANCE_CREATED, &body),
    )
    .await?
    .map_err(TaskError::Mail)?;

    info!(name = %plan.instance.name, ip = %plan.network.ip, "instance launched");
    Ok(())
}
