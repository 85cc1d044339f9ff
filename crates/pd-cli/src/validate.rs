use std::collections::HashSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use pd_infra::config::Flavor;
use pd_infra::types::Instance;

pub const MAX_INSTANCE_NAME_LENGTH: usize = 64;
pub const MAX_USER_NAME_LENGTH: usize = 256;

const PUBLIC_KEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ValidateError {
    #[error("instances list is empty")]
    EmptyInstancesList,

    #[error("instance name is empty")]
    EmptyInstanceName,

    #[error("instance name may only contain letters, digits, and dashes")]
    InvalidInstanceName,

    #[error("instance name is too big (max {MAX_INSTANCE_NAME_LENGTH} characters)")]
    InstanceNameTooBig,

    #[error("invalid flavor")]
    InvalidFlavor,

    #[error("disk size must be positive")]
    NonPositiveDiskSize,

    #[error("user name is empty")]
    EmptyUserName,

    #[error("user name is too big (max {MAX_USER_NAME_LENGTH} characters)")]
    UserNameTooBig,

    #[error("invalid email")]
    InvalidEmail,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("found duplicated instance names")]
    DuplicatedInstanceNames,

    #[error("invalid instance '{name}': {source}")]
    Instance {
        name: String,
        #[source]
        source: Box<ValidateError>,
    },
}

/// Validate a declared instance set before it is handed to the engine,
/// which assumes validated input.
pub fn validate(instances: &[Instance], flavors: &[Flavor]) -> Result<(), ValidateError> {
    if instances.is_empty() {
        return Err(ValidateError::EmptyInstancesList);
    }

    let mut names = HashSet::with_capacity(instances.len());
    for instance in instances {
        validate_instance(instance, flavors).map_err(|source| ValidateError::Instance {
            name: instance.name.clone(),
            source: Box::new(source),
        })?;

        names.insert(instance.name.as_str());
    }

    if names.len() < instances.len() {
        return Err(ValidateError::DuplicatedInstanceNames);
    }

    Ok(())
}

fn validate_instance(instance: &Instance, flavors: &[Flavor]) -> Result<(), ValidateError> {
    if instance.name.is_empty() {
        return Err(ValidateError::EmptyInstanceName);
    }

    if !instance
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ValidateError::InvalidInstanceName);
    }

    if instance.name.len() > MAX_INSTANCE_NAME_LENGTH {
        return Err(ValidateError::InstanceNameTooBig);
    }

    if !flavors.iter().any(|f| f.name == instance.resources.flavor) {
        return Err(ValidateError::InvalidFlavor);
    }

    if instance.resources.disk == 0 {
        return Err(ValidateError::NonPositiveDiskSize);
    }

    if instance.user.name.is_empty() {
        return Err(ValidateError::EmptyUserName);
    }

    if instance.user.name.len() > MAX_USER_NAME_LENGTH {
        return Err(ValidateError::UserNameTooBig);
    }

    if !is_valid_email(&instance.user.email) {
        return Err(ValidateError::InvalidEmail);
    }

    if !is_valid_public_key(&instance.user.public_key) {
        return Err(ValidateError::InvalidPublicKey);
    }

    Ok(())
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
}

/// Check an OpenSSH `authorized_keys`-style public key: a known
/// algorithm followed by a base64 blob whose embedded,
/// length-prefixed algorithm name matches.
fn is_valid_public_key(key: &str) -> bool {
    let mut fields = key.split_whitespace();

    let (Some(algorithm), Some(blob)) = (fields.next(), fields.next()) else {
        return false;
    };

    if !PUBLIC_KEY_ALGORITHMS.contains(&algorithm) {
        return false;
    }

    let Ok(decoded) = BASE64.decode(blob) else {
        return false;
    };

    if decoded.len() < 4 {
        return false;
    }

    let name_len = u32::from_be_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]) as usize;
    decoded
        .get(4..4 + name_len)
        .is_some_and(|name| name == algorithm.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use pd_infra::types::{InstanceResources, User};

    const KEY_1: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMt4RmHplan7NCJJtZEque5vBjvgeAYMncR45lJKG/mL admin@fedora";
    const KEY_2: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIEn0DLc0I+Lmmgjey59zn4AJfrf/o0BCoEMXKK8yOc2v admin2@fedora";

    fn flavors() -> Vec<Flavor> {
        vec![Flavor {
            name: "micro".into(),
            cpu: 1,
            memory: 1,
        }]
    }

    fn instance(name: &str, key: &str) -> Instance {
        Instance {
            name: name.to_string(),
            resources: InstanceResources {
                flavor: "micro".into(),
                disk: 20,
            },
            user: User {
                name: "admin".into(),
                email: "admin@admin.com".into(),
                public_key: key.to_string(),
            },
            expires_at: Utc::now() + Duration::days(30),
        }
    }

    fn inner(err: ValidateError) -> ValidateError {
        match err {
            ValidateError::Instance { source, .. } => *source,
            other => other,
        }
    }

    #[test]
    fn accepts_a_valid_declaration() {
        let instances = vec![instance("u1", KEY_1), instance("u2", KEY_2)];
        assert!(validate(&instances, &flavors()).is_ok());
    }

    #[test]
    fn rejects_an_empty_list() {
        assert_eq!(
            validate(&[], &flavors()),
            Err(ValidateError::EmptyInstancesList)
        );
    }

    #[test]
    fn rejects_bad_instance_names() {
        for name in ["", "aba&caba", "aba@caba", "aba.caba"] {
            let err = inner(validate(&[instance(name, KEY_1)], &flavors()).unwrap_err());
            assert!(
                matches!(
                    err,
                    ValidateError::EmptyInstanceName | ValidateError::InvalidInstanceName
                ),
                "name {name:?} gave {err:?}"
            );
        }

        let long = "a".repeat(MAX_INSTANCE_NAME_LENGTH + 1);
        let err = inner(validate(&[instance(&long, KEY_1)], &flavors()).unwrap_err());
        assert_eq!(err, ValidateError::InstanceNameTooBig);
    }

    #[test]
    fn rejects_unknown_flavor_and_zero_disk() {
        let mut bad_flavor = instance("u1", KEY_1);
        bad_flavor.resources.flavor = "huge".into();
        assert_eq!(
            inner(validate(&[bad_flavor], &flavors()).unwrap_err()),
            ValidateError::InvalidFlavor
        );

        let mut no_disk = instance("u1", KEY_1);
        no_disk.resources.disk = 0;
        assert_eq!(
            inner(validate(&[no_disk], &flavors()).unwrap_err()),
            ValidateError::NonPositiveDiskSize
        );
    }

    #[test]
    fn rejects_bad_emails() {
        for email in ["", "admin", "@admin.com", "admin@", "admin@nodot", "a b@c.de"] {
            let mut bad = instance("u1", KEY_1);
            bad.user.email = email.to_string();
            assert_eq!(
                inner(validate(&[bad], &flavors()).unwrap_err()),
                ValidateError::InvalidEmail,
                "email {email:?}"
            );
        }
    }

    #[test]
    fn rejects_bad_public_keys() {
        let cases = [
            "",
            "ssh-ed25519",
            "ssh-dss AAAAC3NzaC1lZDI1NTE5AAAAIMt4RmHplan7NCJJtZEque5vBjvgeAYMncR45lJKG/mL",
            "ssh-ed25519 not-base64!",
            // Valid base64, but the embedded algorithm is ssh-rsa.
            "ssh-ed25519 AAAAB3NzaC1yc2E=",
        ];

        for key in cases {
            let err = inner(validate(&[instance("u1", key)], &flavors()).unwrap_err());
            assert_eq!(err, ValidateError::InvalidPublicKey, "key {key:?}");
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let instances = vec![instance("u1", KEY_1), instance("u1", KEY_2)];
        assert_eq!(
            validate(&instances, &flavors()),
            Err(ValidateError::DuplicatedInstanceNames)
        );
    }
}
