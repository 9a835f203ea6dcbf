//! Bucket identity, naming conventions and opaque credentials.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

use crate::error::MountError;

/// Default brand prefix used for directories, remotes and service names.
pub const DEFAULT_PREFIX: &str = "haio";

/// Identifies one bucket of one user account.
///
/// At most one mount session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Storage account user name
    pub user: String,
    /// Bucket (container) name
    pub bucket: String,
}

impl BucketKey {
    /// Create a key after validating both parts.
    ///
    /// User names may not contain `-` or `:`, which separate the user from
    /// the bucket in directory names, volume labels and remote specs.
    pub fn new(user: impl Into<String>, bucket: impl Into<String>) -> Result<Self, MountError> {
        let key = Self {
            user: user.into(),
            bucket: bucket.into(),
        };
        if !is_valid_component(&key.user) {
            return Err(MountError::InvalidBucket(format!(
                "Invalid user name '{}'",
                key.user
            )));
        }
        if key.user.contains(USER_RESERVED) {
            return Err(MountError::InvalidBucket(format!(
                "Invalid user name '{}': '-' and ':' are reserved",
                key.user
            )));
        }
        if !is_valid_component(&key.bucket) {
            return Err(MountError::InvalidBucket(format!(
                "Invalid bucket name '{}'",
                key.bucket
            )));
        }
        Ok(key)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.bucket)
    }
}

/// Separators of the user part in OS-visible names.
const USER_RESERVED: [char; 2] = ['-', ':'];

fn is_valid_component(name: &str) -> bool {
    !(name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0', '\n']))
}

/// A bucket as listed by the storage API.
///
/// Only `name` matters to mounting; the counters are display metadata
/// refreshed by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket name
    pub name: String,
    /// Number of objects
    #[serde(default)]
    pub count: u64,
    /// Total size in bytes
    #[serde(default)]
    pub bytes: u64,
}

/// Derives every OS-visible name from a brand prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Naming {
    /// Brand prefix, e.g. `haio`
    pub prefix: String,
}

impl Default for Naming {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl Naming {
    /// Create naming rules with a custom prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// rclone remote name configured for this user (`haio_alice`).
    pub fn remote_name(&self, user: &str) -> String {
        format!("{}_{}", self.prefix, user)
    }

    /// Full remote spec handed to the helper (`haio_alice:photos`).
    ///
    /// rclone reports this as the filesystem name in the POSIX mount table,
    /// which makes it the identity marker there.
    pub fn remote_spec(&self, key: &BucketKey) -> String {
        format!("{}:{}", self.remote_name(&key.user), key.bucket)
    }

    /// Volume label set on Windows mounts (`haio-alice-photos`).
    pub fn volume_label(&self, key: &BucketKey) -> String {
        self.base_name(key)
    }

    /// Conventional per-bucket directory name (`haio-alice-photos`).
    pub fn base_name(&self, key: &BucketKey) -> String {
        format!("{}-{}-{}", self.prefix, key.user, key.bucket)
    }

    /// Prefix shared by every directory this user's buckets can land on.
    pub fn user_dir_prefix(&self, user: &str) -> String {
        format!("{}-{}-", self.prefix, user)
    }

    /// systemd unit name (`haio-alice-photos.service`).
    pub fn unit_name(&self, key: &BucketKey) -> String {
        format!("{}.service", self.service_base(key))
    }

    /// Scheduled task name (`HaioMount-alice-photos`).
    pub fn task_name(&self, key: &BucketKey) -> String {
        let mut chars = self.prefix.chars();
        let brand: String = chars
            .next()
            .map(|c| c.to_uppercase().chain(chars).collect())
            .unwrap_or_default();
        format!(
            "{}Mount-{}-{}",
            escape_service_component(&brand),
            escape_service_component(&key.user),
            escape_service_component(&key.bucket)
        )
    }

    /// Helper log file name inside the cache directory.
    pub fn log_file_name(&self, key: &BucketKey) -> String {
        format!("{}.log", self.service_base(key))
    }

    /// `base_name` with each part escaped for service managers.
    fn service_base(&self, key: &BucketKey) -> String {
        format!(
            "{}-{}-{}",
            escape_service_component(&self.prefix),
            escape_service_component(&key.user),
            escape_service_component(&key.bucket)
        )
    }
}

/// Escape a name part for service managers, which accept only
/// `[A-Za-z0-9_.-]`.
///
/// Every other byte, and `_` itself, becomes `_xx` (lower-case hex of each
/// UTF-8 byte), so distinct inputs never share an escaped form.
pub fn escape_service_component(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-') {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "_{byte:02x}");
        }
    }
    escaped
}

/// Credential material for the helper, passed through as environment
/// variables on the helper process only.
///
/// The manager never persists it and never prints the values.
#[derive(Clone, Default)]
pub struct Credential {
    env: Vec<(String, String)>,
}

impl Credential {
    /// No credential; the helper config file is self-sufficient.
    pub fn none() -> Self {
        Self::default()
    }

    /// Build from `(NAME, value)` pairs.
    pub fn from_env_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            env: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Environment entries to set on the helper.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Whether any material is present.
    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Credential")
            .field("env", &names)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rejects_path_components() {
        assert!(BucketKey::new("alice", "photos").is_ok());
        assert!(BucketKey::new("alice", "").is_err());
        assert!(BucketKey::new("alice", "..").is_err());
        assert!(BucketKey::new("alice", "a/b").is_err());
        assert!(BucketKey::new("a\\b", "photos").is_err());
    }

    #[test]
    fn test_naming_conventions() {
        let naming = Naming::default();
        let key = BucketKey::new("alice", "photos").unwrap();

        assert_eq!(naming.remote_spec(&key), "haio_alice:photos");
        assert_eq!(naming.base_name(&key), "haio-alice-photos");
        assert_eq!(naming.unit_name(&key), "haio-alice-photos.service");
        assert_eq!(naming.task_name(&key), "HaioMount-alice-photos");
        assert_eq!(naming.volume_label(&key), "haio-alice-photos");
    }

    #[test]
    fn test_service_names_are_escaped() {
        let naming = Naming::new("haio");
        let key = BucketKey::new("bob@corp", "my bucket").unwrap();
        assert_eq!(naming.unit_name(&key), "haio-bob_40corp-my_20bucket.service");
        assert_eq!(naming.task_name(&key), "HaioMount-bob_40corp-my_20bucket");
    }

    #[test]
    fn test_user_separators_are_rejected() {
        for user in ["alice-x", "alice:x"] {
            let err = BucketKey::new(user, "photos").unwrap_err();
            assert!(err.to_string().contains("Invalid user name"), "{err}");
        }
        // Buckets keep their separators; the user part is delimited
        assert!(BucketKey::new("alice", "x-photos").is_ok());
        assert!(BucketKey::new("alice", "x:photos").is_ok());
    }

    #[test]
    fn test_similar_buckets_get_distinct_service_names() {
        let naming = Naming::default();
        let spaced = BucketKey::new("alice", "my bucket").unwrap();
        let underscored = BucketKey::new("alice", "my_bucket").unwrap();

        assert_ne!(naming.unit_name(&spaced), naming.unit_name(&underscored));
        assert_ne!(naming.task_name(&spaced), naming.task_name(&underscored));
        assert_ne!(naming.log_file_name(&spaced), naming.log_file_name(&underscored));
        assert_eq!(naming.unit_name(&underscored), "haio-alice-my_5fbucket.service");
    }

    #[test]
    fn test_credential_debug_hides_values() {
        let cred = Credential::from_env_pairs([("RCLONE_CONFIG_HAIO_ALICE_KEY", "s3cret")]);
        let shown = format!("{cred:?}");
        assert!(shown.contains("RCLONE_CONFIG_HAIO_ALICE_KEY"));
        assert!(!shown.contains("s3cret"));
    }
}
