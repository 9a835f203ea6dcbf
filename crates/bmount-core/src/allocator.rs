//! Mount target allocation.
//!
//! A bucket already mounted somewhere in the pool (recognized by its
//! identity marker) keeps that target. Otherwise a free target is chosen
//! deterministically, so the same bucket lands on the same target across
//! runs as long as the free pool is unchanged.
//!
//! "Free" is decided from the live OS state at call time, combined with the
//! targets the calling manager has reserved for operations in flight.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::bucket::{BucketKey, Naming};
use crate::error::MountError;
use crate::probe::{Listing, SystemProbe};
use crate::target::{MountTarget, assignable_drive_letters};

/// The set of targets a platform can hand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPool {
    /// Per-bucket directories under `base_dir`: `P-U-B`, then `P-U-B-2`..
    Directories {
        /// Parent directory (normally the home directory)
        base_dir: PathBuf,
        /// Highest numeric suffix tried
        max_suffix: u32,
    },
    /// Drive letters `D:`..`Z:`
    DriveLetters,
}

/// Identity markers are compared against this form of the bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    /// Helper remote spec, as shown in the mount table
    RemoteSpec,
    /// Volume label
    VolumeLabel,
}

/// Result of an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Chosen target
    pub target: MountTarget,
    /// The bucket was already mounted there
    pub adopted: bool,
}

/// Chooses mount targets for buckets.
pub struct MountTargetAllocator {
    probe: Arc<dyn SystemProbe>,
    pool: TargetPool,
    identity: IdentityKind,
    naming: Naming,
}

impl MountTargetAllocator {
    /// Create an allocator over `pool`.
    pub fn new(
        probe: Arc<dyn SystemProbe>,
        pool: TargetPool,
        identity: IdentityKind,
        naming: Naming,
    ) -> Self {
        Self {
            probe,
            pool,
            identity,
            naming,
        }
    }

    /// The pool this allocator draws from.
    pub fn pool(&self) -> &TargetPool {
        &self.pool
    }

    /// Identity marker a mount of `key` carries.
    pub fn expected_identity(&self, key: &BucketKey) -> String {
        match self.identity {
            IdentityKind::RemoteSpec => self.naming.remote_spec(key),
            IdentityKind::VolumeLabel => self.naming.volume_label(key),
        }
    }

    /// Bucket of `user` an identity marker names, if it names one.
    ///
    /// Returns `None` for user names `BucketKey::new` rejects, since their
    /// prefix would overlap another user's.
    pub fn bucket_from_identity(&self, user: &str, identity: &str) -> Option<String> {
        BucketKey::new(user, "_").ok()?;
        let bucket = match self.identity {
            IdentityKind::RemoteSpec => {
                identity.strip_prefix(&format!("{}:", self.naming.remote_name(user)))?
            }
            IdentityKind::VolumeLabel => identity.strip_prefix(&self.naming.user_dir_prefix(user))?,
        };
        (!bucket.is_empty()).then(|| bucket.to_string())
    }

    /// Every target `key` may use, in preference order.
    pub fn candidates(&self, key: &BucketKey) -> Vec<MountTarget> {
        match &self.pool {
            TargetPool::Directories {
                base_dir,
                max_suffix,
            } => {
                let base = self.naming.base_name(key);
                std::iter::once(base_dir.join(&base))
                    .chain((2..=*max_suffix).map(|n| base_dir.join(format!("{base}-{n}"))))
                    .map(MountTarget::Directory)
                    .collect()
            }
            TargetPool::DriveLetters => assignable_drive_letters(),
        }
    }

    /// Whether `target` belongs to the pool of any bucket of `user`.
    pub fn in_user_pool(&self, user: &str, target: &MountTarget) -> bool {
        match (&self.pool, target) {
            (TargetPool::Directories { base_dir, .. }, MountTarget::Directory(path)) => {
                let prefix = self.naming.user_dir_prefix(user);
                path.parent() == Some(base_dir.as_path())
                    && path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
            }
            (TargetPool::DriveLetters, MountTarget::Drive(_)) => {
                assignable_drive_letters().contains(target)
            }
            _ => false,
        }
    }

    /// Whether `target` is one `key` may use.
    pub fn in_pool(&self, key: &BucketKey, target: &MountTarget) -> bool {
        match &self.pool {
            TargetPool::Directories { .. } => self.candidates(key).contains(target),
            TargetPool::DriveLetters => assignable_drive_letters().contains(target),
        }
    }

    /// A pool target already carrying this bucket's identity marker.
    pub fn find_existing(&self, key: &BucketKey) -> Option<MountTarget> {
        let expected = self.expected_identity(key);
        self.probe
            .mounted()
            .into_iter()
            .filter(|v| v.identity.as_deref() == Some(expected.as_str()))
            .map(|v| v.target)
            .find(|t| self.in_pool(key, t))
    }

    /// Whether a target is unused according to the live OS state.
    pub fn is_free(&self, target: &MountTarget) -> bool {
        if self.probe.is_mount_point(target) {
            return false;
        }
        match target {
            MountTarget::Drive(_) => !self.probe.exists(target),
            MountTarget::Directory(_) => {
                // A leftover empty directory is reusable; a populated one is not ours to take
                matches!(
                    self.probe.list(target, crate::probe::TABLE_QUERY_TIMEOUT),
                    Listing::Missing | Listing::Readable { empty: true }
                )
            }
        }
    }

    /// Choose a target for `key`, skipping `reserved` and `excluded`.
    ///
    /// `reserved` holds targets claimed by operations in flight, `excluded`
    /// targets that already failed for this attempt.
    pub fn allocate(
        &self,
        key: &BucketKey,
        reserved: &HashSet<MountTarget>,
        excluded: &HashSet<MountTarget>,
    ) -> Result<Allocation, MountError> {
        if let Some(target) = self.find_existing(key)
            && !excluded.contains(&target)
        {
            tracing::info!("Adopting existing mount of {} at {}", key, target);
            return Ok(Allocation {
                target,
                adopted: true,
            });
        }

        let free: Vec<MountTarget> = self
            .candidates(key)
            .into_iter()
            .filter(|t| !reserved.contains(t) && !excluded.contains(t))
            .filter(|t| self.is_free(t))
            .collect();

        let target = self
            .choose(key, &free)
            .ok_or_else(|| MountError::TargetConflict {
                target: None,
                reason: match self.pool {
                    TargetPool::DriveLetters => "no free drive letter".to_string(),
                    TargetPool::Directories { .. } => {
                        format!("every directory for {key} is occupied")
                    }
                },
            })?;

        tracing::debug!("Allocated {} for {}", target, key);
        Ok(Allocation {
            target,
            adopted: false,
        })
    }

    /// Deterministic choice from a free pool.
    ///
    /// Directory pools are already per bucket, so the first free entry is
    /// used. Drive letters are shared, so the key is hashed over the sorted
    /// free letters.
    pub fn choose(&self, key: &BucketKey, free: &[MountTarget]) -> Option<MountTarget> {
        match self.pool {
            TargetPool::Directories { .. } => free.first().cloned(),
            TargetPool::DriveLetters => {
                if free.is_empty() {
                    return None;
                }
                let mut sorted = free.to_vec();
                sorted.sort();
                let index = stable_hash(key) % sorted.len() as u64;
                usize::try_from(index)
                    .ok()
                    .and_then(|i| sorted.get(i).cloned())
            }
        }
    }
}

/// Platform-independent hash of a bucket key.
pub fn stable_hash(key: &BucketKey) -> u64 {
    let digest = Sha256::digest(format!("{}/{}", key.user, key.bucket).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use proptest::prelude::*;

    fn drive_allocator(host: &Arc<FakeHost>) -> MountTargetAllocator {
        MountTargetAllocator::new(
            host.clone(),
            TargetPool::DriveLetters,
            IdentityKind::VolumeLabel,
            Naming::default(),
        )
    }

    fn dir_allocator(host: &Arc<FakeHost>) -> MountTargetAllocator {
        MountTargetAllocator::new(
            host.clone(),
            TargetPool::Directories {
                base_dir: PathBuf::from("/home/alice"),
                max_suffix: 3,
            },
            IdentityKind::RemoteSpec,
            Naming::default(),
        )
    }

    fn key(bucket: &str) -> BucketKey {
        BucketKey::new("alice", bucket).unwrap()
    }

    #[test]
    fn test_adopts_existing_mount() {
        let host = Arc::new(FakeHost::windows());
        host.add_foreign_volume(MountTarget::Drive('M'), Some("haio-alice-photos"));

        let alloc = drive_allocator(&host)
            .allocate(&key("photos"), &HashSet::new(), &HashSet::new())
            .unwrap();
        assert_eq!(alloc.target, MountTarget::Drive('M'));
        assert!(alloc.adopted);
    }

    #[test]
    fn test_never_adopts_other_bucket() {
        let host = Arc::new(FakeHost::windows());
        host.add_foreign_volume(MountTarget::Drive('M'), Some("haio-alice-photos"));

        let alloc = drive_allocator(&host)
            .allocate(&key("photo"), &HashSet::new(), &HashSet::new())
            .unwrap();
        assert_ne!(alloc.target, MountTarget::Drive('M'));
        assert!(!alloc.adopted);
    }

    #[test]
    fn test_directory_suffix_when_base_is_populated() {
        let host = Arc::new(FakeHost::posix());
        host.add_directory("/home/alice/haio-alice-photos", &["notes.txt"]);

        let alloc = dir_allocator(&host)
            .allocate(&key("photos"), &HashSet::new(), &HashSet::new())
            .unwrap();
        assert_eq!(
            alloc.target,
            MountTarget::Directory(PathBuf::from("/home/alice/haio-alice-photos-2"))
        );
    }

    #[test]
    fn test_empty_leftover_directory_is_reused() {
        let host = Arc::new(FakeHost::posix());
        host.add_directory("/home/alice/haio-alice-photos", &[]);

        let alloc = dir_allocator(&host)
            .allocate(&key("photos"), &HashSet::new(), &HashSet::new())
            .unwrap();
        assert_eq!(
            alloc.target,
            MountTarget::Directory(PathBuf::from("/home/alice/haio-alice-photos"))
        );
    }

    #[test]
    fn test_exhausted_pool_is_conflict() {
        let host = Arc::new(FakeHost::windows());
        for target in assignable_drive_letters() {
            host.add_foreign_volume(target, None);
        }

        let err = drive_allocator(&host)
            .allocate(&key("photos"), &HashSet::new(), &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, MountError::TargetConflict { target: None, .. }));
    }

    #[test]
    fn test_reserved_targets_are_skipped() {
        let host = Arc::new(FakeHost::windows());
        let allocator = drive_allocator(&host);
        let first = allocator
            .allocate(&key("photos"), &HashSet::new(), &HashSet::new())
            .unwrap()
            .target;

        let reserved: HashSet<_> = [first.clone()].into_iter().collect();
        let second = allocator
            .allocate(&key("photos"), &reserved, &HashSet::new())
            .unwrap()
            .target;
        assert_ne!(first, second);
    }

    #[test]
    fn test_user_pool_membership() {
        let host = Arc::new(FakeHost::posix());
        let allocator = dir_allocator(&host);
        let ours = MountTarget::Directory(PathBuf::from("/home/alice/haio-alice-x-2"));
        let other_user = MountTarget::Directory(PathBuf::from("/home/alice/haio-bob-x"));
        let elsewhere = MountTarget::Directory(PathBuf::from("/mnt/haio-alice-x"));

        assert!(allocator.in_user_pool("alice", &ours));
        assert!(!allocator.in_user_pool("alice", &other_user));
        assert!(!allocator.in_user_pool("alice", &elsewhere));
    }

    #[test]
    fn test_bucket_from_identity() {
        let host = Arc::new(FakeHost::posix());
        let posix = dir_allocator(&host);
        assert_eq!(
            posix.bucket_from_identity("alice", "haio_alice:photos").as_deref(),
            Some("photos")
        );
        assert_eq!(posix.bucket_from_identity("alice", "haio_bob:photos"), None);
        assert_eq!(posix.bucket_from_identity("alice", "haio_alice:"), None);

        let windows = drive_allocator(&Arc::new(FakeHost::windows()));
        assert_eq!(
            windows.bucket_from_identity("alice", "haio-alice-logs").as_deref(),
            Some("logs")
        );
    }

    #[test]
    fn test_dashed_bucket_is_credited_to_its_owner() {
        let windows = drive_allocator(&Arc::new(FakeHost::windows()));
        let key = BucketKey::new("alice", "x-photos").unwrap();
        let label = windows.expected_identity(&key);
        assert_eq!(label, "haio-alice-x-photos");

        assert_eq!(
            windows.bucket_from_identity("alice", &label).as_deref(),
            Some("x-photos")
        );
        // A user whose name would swallow the bucket's dash cannot exist
        assert!(BucketKey::new("alice-x", "photos").is_err());
        assert_eq!(windows.bucket_from_identity("alice-x", &label), None);
    }

    proptest! {
        #[test]
        fn prop_choice_is_deterministic(
            bucket in "[a-z0-9]{1,12}",
            taken in proptest::collection::hash_set(0usize..23, 0..22),
        ) {
            let host = Arc::new(FakeHost::windows());
            let allocator = drive_allocator(&host);
            let free: Vec<MountTarget> = assignable_drive_letters()
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !taken.contains(i))
                .map(|(_, t)| t)
                .collect();
            let k = key(&bucket);

            let first = allocator.choose(&k, &free);
            let mut reversed = free.clone();
            reversed.reverse();
            prop_assert_eq!(&first, &allocator.choose(&k, &free));
            // Candidate order does not matter, only the set
            prop_assert_eq!(&first, &allocator.choose(&k, &reversed));
            prop_assert!(first.is_some_and(|t| free.contains(&t)));
        }

        #[test]
        fn prop_no_false_adoption(
            mounted in proptest::collection::vec("[a-z]{1,6}", 1..8),
            wanted in "[a-z]{1,6}",
        ) {
            let host = Arc::new(FakeHost::windows());
            let letters = assignable_drive_letters();
            for (bucket, target) in mounted.iter().zip(letters.iter()) {
                host.add_foreign_volume(target.clone(), Some(&format!("haio-alice-{bucket}")));
            }

            let allocator = drive_allocator(&host);
            let alloc = allocator
                .allocate(&key(&wanted), &HashSet::new(), &HashSet::new())
                .unwrap();

            if let Some(identity) = host.identity(&alloc.target) {
                prop_assert_eq!(identity, format!("haio-alice-{wanted}"));
                prop_assert!(alloc.adopted);
            } else {
                prop_assert!(!alloc.adopted);
            }
        }
    }
}
