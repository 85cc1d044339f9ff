use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use pd_infra::types::{Instance, InstanceRecord, NetworkInfo, UserInfo};

/// Why an instance is slated for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Observed on the backend but no longer declared.
    Undeclared,
    /// Declared but past its expiry date.
    Expired,
}

/// One instance to remove from the backend.
///
/// `network` is `None` when the address is not known from observed
/// state; the orchestrator resolves it with a backend lookup before
/// building the deletion task.
#[derive(Debug, Clone)]
pub struct DeletionTarget {
    pub name: String,
    pub user: UserInfo,
    pub network: Option<NetworkInfo>,
    pub reason: DeleteReason,
}

/// Classification of one reconciliation pass. Instances in neither set
/// are left untouched.
#[derive(Debug)]
pub struct DiffOutcome {
    pub to_launch: Vec<Instance>,
    pub to_delete: Vec<DeletionTarget>,
}

/// Classify every desired and observed instance into launch, delete, or
/// untouched. Matching is by name only; the caller guarantees both sets
/// are free of duplicate names.
///
/// An expired instance always lands in the delete set and never in the
/// launch set, even if the backend has no record of it.
pub fn diff(desired: &[Instance], observed: &[InstanceRecord], now: DateTime<Utc>) -> DiffOutcome {
    let desired_names: HashSet<&str> = desired.iter().map(|i| i.name.as_str()).collect();
    let observed_by_name: HashMap<&str, &InstanceRecord> =
        observed.iter().map(|r| (r.name.as_str(), r)).collect();

    let mut to_delete = Vec::new();
    for record in observed {
        if !desired_names.contains(record.name.as_str()) {
            to_delete.push(DeletionTarget {
                name: record.name.clone(),
                user: record.user.clone(),
                network: record.network,
                reason: DeleteReason::Undeclared,
            });
        }
    }

    let mut to_launch = Vec::new();
    for instance in desired {
        let record = observed_by_name.get(instance.name.as_str());

        if instance.is_expired_at(now) {
            to_delete.push(DeletionTarget {
                name: instance.name.clone(),
                user: UserInfo {
                    name: instance.user.name.clone(),
                    email: instance.user.email.clone(),
                },
                network: record.and_then(|r| r.network),
                reason: DeleteReason::Expired,
            });
            continue;
        }

        if record.is_none() {
            to_launch.push(instance.clone());
        }
    }

    DiffOutcome {
        to_launch,
        to_delete,
    }
}
