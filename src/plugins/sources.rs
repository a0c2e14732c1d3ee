//! Built-in source kinds.

use crate::{
    error::{BstError, Result},
    source::{Consistency, SourcePlugin},
    utils,
    vdir::{FsDir, ImportOptions, ManifestEntry},
};
use serde::Deserialize;
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Hashes a host path (file or directory) into a stable content digest.
fn content_digest(path: &Path) -> Result<String> {
    if path.is_file() {
        return Ok(utils::sha256_file(path)?.0);
    }
    let manifest = FsDir::new(path)?.manifest()?;
    let mut rendered = String::new();
    for (relpath, entry) in &manifest {
        match entry {
            ManifestEntry::File { hash, executable } => {
                rendered.push_str(&format!("F {relpath} {hash} {executable}\n"))
            }
            ManifestEntry::Symlink { target } => {
                rendered.push_str(&format!("S {relpath} {target}\n"))
            }
            ManifestEntry::Directory => rendered.push_str(&format!("D {relpath}\n")),
        }
    }
    Ok(utils::sha256_hex(rendered))
}

fn stage_path(path: &Path, directory: &Path) -> Result<()> {
    if path.is_file() {
        let name = path.file_name().ok_or_else(|| {
            BstError::source(format!("cannot stage {}: no file name", path.display()))
        })?;
        let dest = directory.join(name);
        utils::create_parent_dir_all(&dest)?;
        fs::copy(path, &dest).map_err(|err| BstError::io(err, &dest))?;
        return Ok(());
    }
    FsDir::new(directory)?.import_files(path, &ImportOptions::linked())?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LocalConfig {
    path: String,
}

/// A file or directory from the project checkout itself.
///
/// Always `Cached`: the content is the checkout. The unique key is a
/// content digest, so editing the staged files reliably changes every
/// derived cache key.
#[derive(Debug)]
pub struct LocalSource {
    path: PathBuf,
}

impl LocalSource {
    pub fn new(project_dir: &Path, config: &serde_yaml::Value) -> Result<Self> {
        let config: LocalConfig = serde_yaml::from_value(config.clone())
            .map_err(|err| BstError::load(format!("invalid local source config: {err}")))?;
        Ok(Self { path: project_dir.join(config.path) })
    }
}

impl SourcePlugin for LocalSource {
    fn kind(&self) -> &str {
        "local"
    }

    fn preflight(&self) -> Result<()> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(BstError::source(format!("local source path {} does not exist", self.path.display()))
                .with_reason("missing-source"))
        }
    }

    fn unique_key(&self) -> Result<Option<Value>> {
        Ok(Some(serde_json::json!({ "digest": content_digest(&self.path)? })))
    }

    fn consistency(&self) -> Result<Consistency> {
        Ok(Consistency::Cached)
    }

    fn get_ref(&self) -> Option<String> {
        None
    }

    fn set_ref(&self, _new_ref: &str) -> Result<()> {
        Ok(())
    }

    fn stage(&self, directory: &Path) -> Result<()> {
        stage_path(&self.path, directory)
    }
}

pub(crate) fn local_factory(
    project_dir: &Path,
    config: &serde_yaml::Value,
) -> Result<Arc<dyn SourcePlugin>> {
    Ok(Arc::new(LocalSource::new(project_dir, config)?))
}

/// An open workspace standing in for an element's sources.
///
/// The unique key follows the directory content, so it only stabilizes
/// once the element has been rebuilt against the current content; until
/// then every derived cache key stays invalidated and dependent artifacts
/// are tainted.
#[derive(Debug)]
pub struct WorkspaceSource {
    path: PathBuf,
    built: AtomicBool,
}

impl WorkspaceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), built: AtomicBool::new(false) }
    }

    pub fn directory(&self) -> &Path {
        &self.path
    }
}

impl SourcePlugin for WorkspaceSource {
    fn kind(&self) -> &str {
        "workspace"
    }

    fn preflight(&self) -> Result<()> {
        if self.path.is_dir() {
            Ok(())
        } else {
            Err(BstError::source(format!(
                "workspace directory {} does not exist",
                self.path.display()
            ))
            .with_reason("missing-source"))
        }
    }

    fn unique_key(&self) -> Result<Option<Value>> {
        Ok(Some(serde_json::json!({ "workspace": content_digest(&self.path)? })))
    }

    fn consistency(&self) -> Result<Consistency> {
        Ok(Consistency::Cached)
    }

    fn get_ref(&self) -> Option<String> {
        None
    }

    fn set_ref(&self, _new_ref: &str) -> Result<()> {
        Ok(())
    }

    fn stage(&self, directory: &Path) -> Result<()> {
        stage_path(&self.path, directory)
    }

    fn is_stable(&self) -> bool {
        self.built.load(Ordering::Relaxed)
    }

    fn is_workspace(&self) -> bool {
        true
    }

    fn mark_built(&self) {
        self.built.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn local_source_key_tracks_content() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("files")).unwrap();
        fs::write(tmp.path().join("files/x"), "1").unwrap();

        let config: serde_yaml::Value = serde_yaml::from_str("path: files").unwrap();
        let source = LocalSource::new(tmp.path(), &config).unwrap();
        source.preflight().unwrap();
        let before = source.unique_key().unwrap();

        fs::write(tmp.path().join("files/x"), "2").unwrap();
        let after = source.unique_key().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn local_source_stages_its_tree() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("files/sub")).unwrap();
        fs::write(tmp.path().join("files/sub/data"), "payload").unwrap();

        let config: serde_yaml::Value = serde_yaml::from_str("path: files").unwrap();
        let source = LocalSource::new(tmp.path(), &config).unwrap();
        let dest = tmp.path().join("staged");
        source.stage(&dest).unwrap();
        assert_eq!(fs::read(dest.join("sub/data")).unwrap(), b"payload");
    }

    #[test]
    fn workspace_stabilizes_after_build() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = WorkspaceSource::new(tmp.path());
        assert!(workspace.is_workspace());
        assert!(!workspace.is_stable());
        workspace.mark_built();
        assert!(workspace.is_stable());
    }
}
