//! Remote artifact cache specs and the transport seam.
//!
//! The wire protocol is not this crate's concern; the pipeline talks to a
//! [`CasRemote`] trait object and any transport satisfying it plugs in. A
//! directory backed implementation ships here for `file://` remotes, which
//! is also what the test suite exercises.

use crate::{
    cas::{CasCache, Digest},
    error::{BstError, Result},
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// TLS client material for authenticated remotes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSpec {
    #[serde(default, rename = "server-cert")]
    pub ca: Option<PathBuf>,
    #[serde(default, rename = "client-cert")]
    pub cert: Option<PathBuf>,
    #[serde(default, rename = "client-key")]
    pub key: Option<PathBuf>,
}

/// One configured remote artifact cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub url: String,
    /// Whether this session may upload artifacts to the remote.
    #[serde(default)]
    pub push: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl RemoteSpec {
    pub fn new(url: impl Into<String>, push: bool) -> Self {
        Self { url: url.into(), push, tls: None, instance: None }
    }
}

/// Merges remote spec lists by priority, dropping duplicate urls.
///
/// Priority order: command line override, project specific user
/// configuration, project configuration, then user global configuration.
pub fn resolve_remote_specs(
    override_specs: &[RemoteSpec],
    project_user_specs: &[RemoteSpec],
    project_specs: &[RemoteSpec],
    user_specs: &[RemoteSpec],
) -> Vec<RemoteSpec> {
    let mut seen = std::collections::BTreeSet::new();
    let mut resolved = Vec::new();
    for spec in override_specs
        .iter()
        .chain(project_user_specs)
        .chain(project_specs)
        .chain(user_specs)
    {
        if seen.insert(spec.url.clone()) {
            resolved.push(spec.clone());
        }
    }
    resolved
}

/// The transport contract consumed by the artifact cache.
///
/// Implementations must be idempotent: pushing a blob or ref that already
/// exists remotely is a no-op.
pub trait CasRemote: Send + Sync + fmt::Debug {
    /// The spec this remote was built from.
    fn spec(&self) -> &RemoteSpec;

    /// Verifies the remote is reachable and compatible.
    fn check(&self) -> Result<()>;

    /// Whether the remote stores the blob.
    fn has(&self, digest: &Digest) -> Result<bool>;

    /// Downloads a blob.
    fn fetch_blob(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Uploads a blob.
    fn push_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<()>;

    /// Resolves a remote ref, `None` when absent.
    fn resolve_ref(&self, ref_name: &str) -> Result<Option<Digest>>;

    /// Creates or replaces a remote ref.
    fn set_ref(&self, ref_name: &str, digest: &Digest) -> Result<()>;

    /// Walks the remote Merkle tree below `root`, yielding every reachable
    /// digest (the root tree object included).
    fn fetch_directory(&self, root: &Digest) -> Result<Vec<Digest>>;

    /// Resolves a bundled tree object to its root directory digest.
    ///
    /// Directory objects in this store are self rooting, so the default is
    /// the identity; transports whose wire format ships subtree objects as
    /// one bundle unpack it here and return the root.
    fn fetch_tree(&self, tree_digest: &Digest) -> Result<Digest> {
        Ok(tree_digest.clone())
    }
}

/// A remote backed by a plain directory, addressed with a `file://` url.
///
/// Shares the on-disk layout of the local store, which makes it equally
/// suitable for network mounts and for tests.
#[derive(Debug)]
pub struct FsRemote {
    spec: RemoteSpec,
    store: CasCache,
}

impl FsRemote {
    pub fn open(spec: RemoteSpec) -> Result<Self> {
        let path = spec
            .url
            .strip_prefix("file://")
            .ok_or_else(|| {
                BstError::artifact(format!("unsupported remote url {:?}", spec.url))
                    .with_reason("remote-unavailable")
            })?
            .to_string();
        let store = CasCache::new(PathBuf::from(path))?;
        Ok(Self { spec, store })
    }
}

impl CasRemote for FsRemote {
    fn spec(&self) -> &RemoteSpec {
        &self.spec
    }

    fn check(&self) -> Result<()> {
        if self.store.directory().is_dir() {
            Ok(())
        } else {
            Err(BstError::artifact(format!("remote {:?} is not accessible", self.spec.url))
                .with_reason("remote-unavailable"))
        }
    }

    fn has(&self, digest: &Digest) -> Result<bool> {
        Ok(self.store.contains(digest))
    }

    fn fetch_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.store.read_object(digest)
    }

    fn push_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let stored = self.store.add_bytes(bytes)?;
        if &stored != digest {
            return Err(BstError::artifact(format!(
                "pushed blob hashed to {stored}, expected {digest}"
            ))
            .with_reason("verification-failed"));
        }
        Ok(())
    }

    fn resolve_ref(&self, ref_name: &str) -> Result<Option<Digest>> {
        if !self.store.has_ref(ref_name) {
            return Ok(None);
        }
        self.store.resolve_ref(ref_name).map(Some)
    }

    fn set_ref(&self, ref_name: &str, digest: &Digest) -> Result<()> {
        self.store.set_ref(ref_name, digest)
    }

    fn fetch_directory(&self, root: &Digest) -> Result<Vec<Digest>> {
        self.store.walk_digests(root)
    }
}

/// Builds a transport for the given spec.
///
/// Only `file://` urls are handled natively; other schemes must be provided
/// by the embedding frontend through [`CasRemote`] implementations.
pub fn remote_from_spec(spec: &RemoteSpec) -> Result<Box<dyn CasRemote>> {
    if spec.url.starts_with("file://") {
        return Ok(Box::new(FsRemote::open(spec.clone())?));
    }
    Err(BstError::artifact(format!("no transport available for remote {:?}", spec.url))
        .with_reason("remote-unavailable"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn spec_priority_dedups_by_url() {
        let override_specs = [RemoteSpec::new("file:///shared", true)];
        let project_specs =
            [RemoteSpec::new("file:///shared", false), RemoteSpec::new("file:///project", false)];
        let user_specs = [RemoteSpec::new("file:///user", true)];

        let resolved = resolve_remote_specs(&override_specs, &[], &project_specs, &user_specs);
        assert_eq!(
            resolved.iter().map(|s| s.url.as_str()).collect::<Vec<_>>(),
            vec!["file:///shared", "file:///project", "file:///user"]
        );
        // The override's push flag wins for the duplicated url.
        assert!(resolved[0].push);
    }

    #[test]
    fn fs_remote_round_trips_blobs_and_refs() {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("file://{}", tmp.path().join("remote").display());
        let remote = FsRemote::open(RemoteSpec::new(url, true)).unwrap();
        remote.check().unwrap();

        let digest = Digest::of_bytes(b"blob");
        assert!(!remote.has(&digest).unwrap());
        remote.push_blob(&digest, b"blob").unwrap();
        assert!(remote.has(&digest).unwrap());
        assert_eq!(remote.fetch_blob(&digest).unwrap(), b"blob");

        assert_eq!(remote.resolve_ref("p/e/k").unwrap(), None);
        remote.set_ref("p/e/k", &digest).unwrap();
        assert_eq!(remote.resolve_ref("p/e/k").unwrap(), Some(digest));
    }

    #[test]
    fn corrupt_push_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("file://{}", tmp.path().join("remote").display());
        let remote = FsRemote::open(RemoteSpec::new(url, true)).unwrap();
        let digest = Digest::of_bytes(b"expected");
        let err = remote.push_blob(&digest, b"actual").unwrap_err();
        assert_eq!(err.reason(), Some("verification-failed"));
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        let err = remote_from_spec(&RemoteSpec::new("https://cache.example.com", false)).unwrap_err();
        assert_eq!(err.reason(), Some("remote-unavailable"));
    }
}
