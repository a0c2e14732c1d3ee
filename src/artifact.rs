//! The artifact cache: committed build outputs behind named refs.
//!
//! A committed artifact is a directory object with fixed children
//! (`files/`, `logs/build.log`, `meta/public.yaml`, `meta/artifact.yaml`)
//! pointed at by one ref per cache key. Commits enforce the cache quota by
//! evicting unreferenced artifacts in LRU order, never touching the
//! session's required set.

use crate::{
    cas::{CasCache, Digest},
    error::{BstError, Result},
    remote::{remote_from_spec, CasRemote, RemoteSpec},
    utils,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// In-artifact path of the metadata file.
pub const META_ARTIFACT: &str = "meta/artifact.yaml";
/// In-artifact path of the resolved public data.
pub const META_PUBLIC: &str = "meta/public.yaml";
/// In-artifact path of the captured build log.
pub const BUILD_LOG: &str = "logs/build.log";
/// In-artifact directory holding the installed payload.
pub const FILES_DIR: &str = "files";

/// The cache keys recorded inside an artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKeys {
    pub strong: String,
    pub weak: String,
    /// Strong keys of the direct build dependencies, by element name.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// The `meta/artifact.yaml` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub keys: ArtifactKeys,
    #[serde(default)]
    pub workspaced: bool,
    #[serde(default)]
    pub workspaced_dependencies: Vec<String>,
}

/// The local artifact cache plus its configured remotes.
#[derive(Debug)]
pub struct ArtifactCache {
    cas: std::sync::Arc<CasCache>,
    extractdir: PathBuf,
    quota: Option<u64>,
    required: Mutex<BTreeSet<String>>,
    remotes: Vec<Box<dyn CasRemote>>,
}

impl ArtifactCache {
    pub fn new(
        cas: std::sync::Arc<CasCache>,
        extractdir: impl Into<PathBuf>,
        quota: Option<u64>,
    ) -> Self {
        Self {
            cas,
            extractdir: extractdir.into(),
            quota,
            required: Mutex::new(BTreeSet::new()),
            remotes: Vec::new(),
        }
    }

    /// Connects the configured remotes, skipping (and logging) unreachable
    /// ones.
    pub fn initialize_remotes(&mut self, specs: &[RemoteSpec]) {
        for spec in specs {
            match remote_from_spec(spec).and_then(|remote| {
                remote.check()?;
                Ok(remote)
            }) {
                Ok(remote) => self.remotes.push(remote),
                Err(err) => warn!(url = %spec.url, %err, "skipping unreachable remote"),
            }
        }
    }

    /// The backing object store.
    pub fn cas(&self) -> &std::sync::Arc<CasCache> {
        &self.cas
    }

    pub fn has_fetch_remotes(&self) -> bool {
        !self.remotes.is_empty()
    }

    pub fn has_push_remotes(&self) -> bool {
        self.remotes.iter().any(|remote| remote.spec().push)
    }

    /// The ref name an artifact lives under.
    pub fn artifact_ref(project: &str, element: &str, key: &str) -> String {
        format!("{project}/{element}/{key}")
    }

    /// Whether the artifact is cached locally.
    pub fn contains(&self, project: &str, element: &str, key: &str) -> bool {
        self.cas.has_ref(&Self::artifact_ref(project, element, key))
    }

    /// Whether any remote holds the artifact.
    pub fn remote_contains(&self, project: &str, element: &str, key: &str) -> Result<bool> {
        let ref_name = Self::artifact_ref(project, element, key);
        for remote in &self.remotes {
            if remote.resolve_ref(&ref_name)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Marks cache keys as required by the running session, shielding them
    /// from eviction and refreshing their timestamps so concurrent
    /// sessions' LRU sees them as hot.
    pub fn mark_required(&self, project: &str, element: &str, keys: &[String]) {
        let mut required = self.required.lock().unwrap();
        for key in keys {
            required.insert(key.clone());
            let ref_name = Self::artifact_ref(project, element, key);
            if self.cas.has_ref(&ref_name) {
                let _ = self.cas.update_atime(&ref_name);
            }
        }
    }

    /// Commits an assembled artifact directory under one ref per key.
    ///
    /// Evicts least recently used, non-required artifacts until the quota
    /// holds; fails with reason `too-large` when that is impossible.
    #[instrument(skip(self, content))]
    pub fn commit(
        &self,
        project: &str,
        element: &str,
        content: &Path,
        keys: &[String],
    ) -> Result<()> {
        let incoming = utils::dir_size(content)?;
        if let Some(quota) = self.quota {
            if incoming > quota {
                return Err(BstError::artifact(
                    "the artifact is too large for the configured cache quota",
                )
                .with_reason("too-large"));
            }
            loop {
                let current = self.cas.total_size()?;
                if current + incoming <= quota {
                    break;
                }
                self.evict_one()?;
            }
        }

        let digest = self.cas.import_tree(content)?;
        for key in keys {
            self.cas.set_ref(&Self::artifact_ref(project, element, key), &digest)?;
        }
        debug!(%digest, ?keys, "committed artifact");
        Ok(())
    }

    fn evict_one(&self) -> Result<()> {
        let required = self.required.lock().unwrap().clone();
        let candidate = self
            .cas
            .list_refs()?
            .into_iter()
            .find(|ref_name| {
                let key = ref_name.rsplit('/').next().unwrap_or_default();
                !required.contains(key)
            })
            .ok_or_else(|| {
                BstError::artifact(
                    "the artifact is too large for the cache given the artifacts required by this session",
                )
                .with_reason("too-large")
            })?;
        let freed = self.cas.remove_ref(&candidate)?;
        debug!(%candidate, freed, "evicted artifact");
        Ok(())
    }

    /// Checks an artifact out of the store, hardlinking blobs.
    ///
    /// Concurrent extractors race on the final rename; losing the race is
    /// success.
    pub fn extract(&self, project: &str, element: &str, key: &str) -> Result<PathBuf> {
        let ref_name = Self::artifact_ref(project, element, key);
        let digest = self.cas.resolve_ref(&ref_name).map_err(|err| {
            BstError::artifact(format!("missing artifact for {project}/{element}/{key}: {err}"))
                .with_reason("missing-artifact")
        })?;

        let dest_parent = self.extractdir.join(project).join(element);
        let dest = dest_parent.join(&digest.hash);
        if dest.is_dir() {
            return Ok(dest);
        }
        fs::create_dir_all(&dest_parent).map_err(|err| BstError::io(err, &dest_parent))?;
        let staging = tempfile::tempdir_in(&dest_parent)
            .map_err(|err| BstError::io(err, &dest_parent))?;
        let checkout = staging.path().join("checkout");
        self.cas.checkout(&checkout, &digest, true)?;
        match fs::rename(&checkout, &dest) {
            Ok(()) => Ok(dest),
            // Someone else extracted the same digest concurrently.
            Err(_) if dest.is_dir() => Ok(dest),
            Err(err) => Err(BstError::io(err, dest)),
        }
    }

    /// Points a second key at an already present artifact.
    pub fn link_key(&self, project: &str, element: &str, old_key: &str, new_key: &str) -> Result<()> {
        let digest = self.cas.resolve_ref(&Self::artifact_ref(project, element, old_key))?;
        self.cas.set_ref(&Self::artifact_ref(project, element, new_key), &digest)
    }

    /// Reads the metadata of a locally cached artifact.
    pub fn load_meta(&self, project: &str, element: &str, key: &str) -> Result<ArtifactMeta> {
        let extracted = self.extract(project, element, key)?;
        utils::read_yaml_file(&extracted.join(META_ARTIFACT))
    }

    /// Tries to populate the local cache for `key` from the remotes, in
    /// priority order.
    ///
    /// Returns whether anything was pulled. A missing remote ref is not an
    /// error; transport failures are, unless a later remote succeeds.
    pub fn pull(&self, project: &str, element: &str, key: &str) -> Result<bool> {
        let ref_name = Self::artifact_ref(project, element, key);
        let mut first_error = None;
        for remote in &self.remotes {
            match self.pull_from(remote.as_ref(), &ref_name) {
                Ok(true) => {
                    info!(url = %remote.spec().url, ref_name, "pulled artifact");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(url = %remote.spec().url, %err, "pull failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    fn pull_from(&self, remote: &dyn CasRemote, ref_name: &str) -> Result<bool> {
        let Some(digest) = remote.resolve_ref(ref_name)? else {
            return Ok(false);
        };
        for blob in remote.fetch_directory(&digest)? {
            if self.cas.contains(&blob) {
                continue;
            }
            let bytes = remote.fetch_blob(&blob)?;
            let stored = self.cas.add_bytes(&bytes)?;
            if stored != blob {
                return Err(BstError::artifact(format!(
                    "remote blob {blob} hashed to {stored} after transfer"
                ))
                .with_reason("verification-failed"));
            }
        }
        self.cas.set_ref(ref_name, &digest)?;
        Ok(true)
    }

    /// Whether any push remote is missing the artifact.
    pub fn push_needed(&self, project: &str, element: &str, key: &str) -> Result<bool> {
        let ref_name = Self::artifact_ref(project, element, key);
        for remote in &self.remotes {
            if remote.spec().push && remote.resolve_ref(&ref_name)?.is_none() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Replicates a locally cached artifact to every push remote lacking
    /// it. The first key must be the strong key; all keys end up as remote
    /// refs. Returns whether any remote changed.
    pub fn push(&self, project: &str, element: &str, keys: &[String]) -> Result<bool> {
        let strong_key = keys.first().ok_or_else(|| {
            BstError::artifact("push requires at least the strong key").with_reason("push-failed")
        })?;
        let strong_ref = Self::artifact_ref(project, element, strong_key);
        let digest = self.cas.resolve_ref(&strong_ref)?;

        let mut pushed = false;
        for remote in &self.remotes {
            if !remote.spec().push {
                continue;
            }
            if remote.resolve_ref(&strong_ref)?.is_some() {
                continue;
            }
            let blobs = self.cas.walk_digests(&digest)?;
            let missing: Vec<&Digest> = blobs
                .par_iter()
                .filter_map(|blob| match remote.has(blob) {
                    Ok(false) => Some(Ok(blob)),
                    Ok(true) => None,
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>>>()?;
            missing
                .par_iter()
                .map(|blob| {
                    let bytes = self.cas.read_object(blob)?;
                    remote.push_blob(blob, &bytes)
                })
                .collect::<Result<Vec<_>>>()?;
            for key in keys {
                remote.set_ref(&Self::artifact_ref(project, element, key), &digest)?;
            }
            info!(url = %remote.spec().url, element, "pushed artifact");
            pushed = true;
        }
        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        cache: ArtifactCache,
    }

    fn fixture(quota: Option<u64>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let cas = Arc::new(CasCache::new(root.join("cas")).unwrap());
        let cache = ArtifactCache::new(cas, root.join("extract"), quota);
        Fixture { _tmp: tmp, root, cache }
    }

    fn artifact_dir(root: &Path, name: &str, payload_size: usize, fill: u8) -> PathBuf {
        let dir = root.join(format!("assembled-{name}"));
        fs::create_dir_all(dir.join(FILES_DIR)).unwrap();
        fs::create_dir_all(dir.join("logs")).unwrap();
        fs::create_dir_all(dir.join("meta")).unwrap();
        fs::write(dir.join(FILES_DIR).join("payload"), vec![fill; payload_size]).unwrap();
        fs::write(dir.join(BUILD_LOG), b"log\n").unwrap();
        let meta = ArtifactMeta {
            keys: ArtifactKeys {
                strong: format!("strong-{name}"),
                weak: format!("weak-{name}"),
                dependencies: BTreeMap::new(),
            },
            workspaced: false,
            workspaced_dependencies: vec![],
        };
        fs::write(dir.join(META_ARTIFACT), serde_yaml::to_string(&meta).unwrap()).unwrap();
        fs::write(dir.join(META_PUBLIC), "bst: {}\n").unwrap();
        dir
    }

    #[test]
    fn commit_and_extract_round_trip() {
        let f = fixture(None);
        let content = artifact_dir(&f.root, "a", 16, 1);
        f.cache.commit("proj", "elem", &content, &["key-1".into(), "key-2".into()]).unwrap();

        assert!(f.cache.contains("proj", "elem", "key-1"));
        assert!(f.cache.contains("proj", "elem", "key-2"));

        let extracted = f.cache.extract("proj", "elem", "key-1").unwrap();
        assert_eq!(fs::read(extracted.join(FILES_DIR).join("payload")).unwrap(), vec![1u8; 16]);
        // A second extract resolves to the same checkout.
        assert_eq!(f.cache.extract("proj", "elem", "key-2").unwrap(), extracted);
    }

    #[test]
    fn oversized_artifact_is_rejected_outright() {
        let f = fixture(Some(1024));
        let content = artifact_dir(&f.root, "big", 4096, 2);
        let err = f.cache.commit("proj", "big", &content, &["k".into()]).unwrap_err();
        assert_eq!(err.reason(), Some("too-large"));
    }

    #[test]
    fn quota_evicts_lru_but_spares_required() {
        let f = fixture(Some(4096));

        let a = artifact_dir(&f.root, "a", 3000, 1);
        f.cache.commit("proj", "a", &a, &["key-a".into()]).unwrap();

        let b = artifact_dir(&f.root, "b", 2000, 2);
        f.cache.commit("proj", "b", &b, &["key-b".into()]).unwrap();
        assert!(!f.cache.contains("proj", "a", "key-a"));
        assert!(f.cache.contains("proj", "b", "key-b"));

        // With `b` required, a third artifact cannot be accommodated.
        f.cache.mark_required("proj", "b", &["key-b".into()]);
        let c = artifact_dir(&f.root, "c", 3000, 3);
        let err = f.cache.commit("proj", "c", &c, &["key-c".into()]).unwrap_err();
        assert_eq!(err.reason(), Some("too-large"));
        assert!(f.cache.contains("proj", "b", "key-b"));
    }

    #[test]
    fn link_key_aliases_the_same_digest() {
        let f = fixture(None);
        let content = artifact_dir(&f.root, "a", 8, 1);
        f.cache.commit("proj", "elem", &content, &["weak-key".into()]).unwrap();
        f.cache.link_key("proj", "elem", "weak-key", "strong-key").unwrap();

        let weak = f.cache.cas().resolve_ref("proj/elem/weak-key").unwrap();
        let strong = f.cache.cas().resolve_ref("proj/elem/strong-key").unwrap();
        assert_eq!(weak, strong);
    }

    #[test]
    fn meta_round_trips_through_commit() {
        let f = fixture(None);
        let content = artifact_dir(&f.root, "m", 8, 1);
        f.cache.commit("proj", "elem", &content, &["k".into()]).unwrap();
        let meta = f.cache.load_meta("proj", "elem", "k").unwrap();
        assert_eq!(meta.keys.strong, "strong-m");
        assert_eq!(meta.keys.weak, "weak-m");
    }

    #[test]
    fn push_and_pull_through_a_file_remote() {
        let f = fixture(None);
        let remote_url = format!("file://{}", f.root.join("remote").display());
        let mut cache = f.cache;
        cache.initialize_remotes(&[RemoteSpec::new(remote_url.clone(), true)]);

        let content = artifact_dir(&f.root, "p", 32, 5);
        cache.commit("proj", "elem", &content, &["strong".into(), "weak".into()]).unwrap();

        assert!(cache.push_needed("proj", "elem", "strong").unwrap());
        assert!(cache.push("proj", "elem", &["strong".into(), "weak".into()]).unwrap());
        assert!(!cache.push_needed("proj", "elem", "strong").unwrap());
        // Pushing again is a no-op.
        assert!(!cache.push("proj", "elem", &["strong".into(), "weak".into()]).unwrap());

        // A fresh local cache can pull what was pushed.
        let tmp2 = tempfile::tempdir().unwrap();
        let cas2 = Arc::new(CasCache::new(tmp2.path().join("cas")).unwrap());
        let mut cache2 = ArtifactCache::new(cas2, tmp2.path().join("extract"), None);
        cache2.initialize_remotes(&[RemoteSpec::new(remote_url, false)]);

        assert!(cache2.remote_contains("proj", "elem", "strong").unwrap());
        assert!(cache2.pull("proj", "elem", "strong").unwrap());
        let extracted = cache2.extract("proj", "elem", "strong").unwrap();
        assert_eq!(fs::read(extracted.join(FILES_DIR).join("payload")).unwrap(), vec![5u8; 32]);

        // Pulling a key no remote has reports false, not an error.
        assert!(!cache2.pull("proj", "elem", "absent").unwrap());
    }
}
