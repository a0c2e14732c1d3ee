//! The CAS backed directory view.

use crate::{
    cas::{CasCache, Digest, DirectoryNode, FileNode, SymlinkNode, Tree},
    error::{BstError, Result},
    vdir::{
        join_rel, path_components, reasons, DiffResult, FileListResult, ImportOptions, Manifest,
        ManifestEntry, MAX_SYMLINK_HOPS,
    },
};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs,
    path::Path,
    sync::Arc,
};

/// One materialized entry of a [`CasDir`] index.
#[derive(Clone, Debug)]
enum CasEntry {
    File { digest: Digest, executable: bool },
    Symlink { target: String },
    Directory(CasDir),
}

/// Lightweight answer to "what kind of entry sits at this name".
enum Probe {
    Directory,
    File,
    Symlink(String),
}

/// What an import found occupying a destination name.
enum ExistingKind {
    Absent,
    Directory,
    EmptyDirectory,
    Other,
}

/// A directory tree backed by the content addressed store.
///
/// The index over the referenced directory object is materialized lazily on
/// first access; mutations invalidate the cached digest and
/// [`CasDir::digest`] recomputes the Merkle tree bottom up on demand.
#[derive(Clone, Debug)]
pub struct CasDir {
    cas: Arc<CasCache>,
    digest: Option<Digest>,
    entries: Option<BTreeMap<String, CasEntry>>,
}

impl CasDir {
    /// A new, empty directory.
    pub fn empty(cas: Arc<CasCache>) -> Self {
        Self { cas, digest: None, entries: Some(BTreeMap::new()) }
    }

    /// Opens the directory object `digest` references.
    pub fn open(cas: Arc<CasCache>, digest: Digest) -> Self {
        Self { cas, digest: Some(digest), entries: None }
    }

    /// The backing store.
    pub fn cas(&self) -> &Arc<CasCache> {
        &self.cas
    }

    fn index_mut(&mut self) -> Result<&mut BTreeMap<String, CasEntry>> {
        if self.entries.is_none() {
            let digest =
                self.digest.clone().expect("unmaterialized directory carries its digest");
            let tree = self.cas.read_tree(&digest)?;
            let mut entries = BTreeMap::new();
            for file in tree.files {
                entries.insert(
                    file.name,
                    CasEntry::File { digest: file.digest, executable: file.is_executable },
                );
            }
            for dir in tree.directories {
                entries
                    .insert(dir.name, CasEntry::Directory(CasDir::open(self.cas.clone(), dir.digest)));
            }
            for symlink in tree.symlinks {
                entries.insert(symlink.name, CasEntry::Symlink { target: symlink.target });
            }
            self.entries = Some(entries);
        }
        Ok(self.entries.as_mut().expect("entries just populated"))
    }

    /// The digest of this directory's current contents.
    ///
    /// Recomputes (and stores) the Merkle tree bottom up when the index has
    /// been materialized, so mutations anywhere below are always reflected.
    pub fn digest(&mut self) -> Result<Digest> {
        if self.entries.is_none() {
            return Ok(self.digest.clone().expect("unmaterialized directory carries its digest"));
        }
        let mut tree = Tree::default();
        let cas = self.cas.clone();
        for (name, entry) in self.entries.as_mut().expect("checked above").iter_mut() {
            match entry {
                CasEntry::File { digest, executable } => tree.files.push(FileNode {
                    name: name.clone(),
                    digest: digest.clone(),
                    is_executable: *executable,
                }),
                CasEntry::Symlink { target } => {
                    tree.symlinks.push(SymlinkNode { name: name.clone(), target: target.clone() })
                }
                CasEntry::Directory(dir) => tree
                    .directories
                    .push(DirectoryNode { name: name.clone(), digest: dir.digest()? }),
            }
        }
        let digest = cas.add_tree(&tree)?;
        self.digest = Some(digest.clone());
        Ok(digest)
    }

    /// Whether this directory has no entries at all.
    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.index_mut()?.is_empty())
    }

    /// Descends into the subdirectory at `path`, optionally creating the
    /// missing levels.
    ///
    /// Symlinks are followed with a hop budget; exceeding it fails with the
    /// `symlink-loop` reason, a symlink pointing to a file fails with
    /// `not-a-directory`, and a missing component without `create` fails
    /// with `not-found`.
    pub fn descend(&mut self, path: &str, create: bool) -> Result<&mut CasDir> {
        let resolved = self.resolve_path(path_components(path), create, true)?;
        self.dir_at_mut(&resolved)
    }

    /// Like [`CasDir::descend`] but refusing to resolve absolute symlink
    /// targets (`absolute-escape`).
    pub fn descend_no_absolute(&mut self, path: &str, create: bool) -> Result<&mut CasDir> {
        let resolved = self.resolve_path(path_components(path), create, false)?;
        self.dir_at_mut(&resolved)
    }

    fn resolve_path(
        &mut self,
        components: Vec<String>,
        create: bool,
        allow_absolute: bool,
    ) -> Result<Vec<String>> {
        let mut queue: VecDeque<String> = components.into();
        let mut path: Vec<String> = Vec::new();
        let mut hops = 0usize;
        while let Some(component) = queue.pop_front() {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                // `..` from the root stays at the root.
                path.pop();
                continue;
            }
            match self.probe(&path, &component)? {
                Some(Probe::Directory) => path.push(component),
                Some(Probe::File) => {
                    return Err(BstError::cas(format!(
                        "cannot descend into {component:?}, which is not a directory"
                    ))
                    .with_reason(reasons::NOT_A_DIRECTORY))
                }
                Some(Probe::Symlink(target)) => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(BstError::cas(format!(
                            "symlink {component:?} leads into a loop"
                        ))
                        .with_reason(reasons::SYMLINK_LOOP));
                    }
                    if target.starts_with('/') {
                        if !allow_absolute {
                            return Err(BstError::cas(format!(
                                "symlink {component:?} has an absolute target {target:?}"
                            ))
                            .with_reason(reasons::ABSOLUTE_ESCAPE));
                        }
                        path.clear();
                    }
                    for part in target.split('/').rev() {
                        if !part.is_empty() {
                            queue.push_front(part.to_string());
                        }
                    }
                }
                None => {
                    if create {
                        let dir = self.dir_at_mut(&path)?;
                        let empty = CasDir::empty(dir.cas.clone());
                        dir.index_mut()?.insert(component.clone(), CasEntry::Directory(empty));
                        dir.digest = None;
                        path.push(component);
                    } else {
                        return Err(BstError::cas(format!("no entry called {component:?}"))
                            .with_reason(reasons::NOT_FOUND));
                    }
                }
            }
        }
        Ok(path)
    }

    fn probe(&mut self, path: &[String], name: &str) -> Result<Option<Probe>> {
        let dir = self.dir_at_mut(path)?;
        Ok(dir.index_mut()?.get(name).map(|entry| match entry {
            CasEntry::Directory(_) => Probe::Directory,
            CasEntry::File { .. } => Probe::File,
            CasEntry::Symlink { target } => Probe::Symlink(target.clone()),
        }))
    }

    fn dir_at_mut(&mut self, path: &[String]) -> Result<&mut CasDir> {
        let mut current: &mut CasDir = self;
        for component in path {
            let entries = current.index_mut()?;
            current = match entries.get_mut(component) {
                Some(CasEntry::Directory(dir)) => dir,
                _ => {
                    return Err(BstError::cas(format!("{component:?} is not a directory"))
                        .with_reason(reasons::NOT_A_DIRECTORY))
                }
            };
        }
        Ok(current)
    }

    /// Imports a subtree from another CAS directory.
    ///
    /// Directory entries merge recursively; a file or symlink replaces any
    /// existing non-directory entry and any existing *empty* directory
    /// (recorded in `overwritten`), while a non-empty directory wins over an
    /// incoming file (recorded in `ignored`).
    pub fn import_files(
        &mut self,
        source: &mut CasDir,
        options: &ImportOptions,
    ) -> Result<FileListResult> {
        let mut result = FileListResult::default();
        let mut found = BTreeSet::new();
        self.import_cas(source, "", options, &mut result, &mut found)?;
        check_missing(options, &found)?;
        Ok(result)
    }

    /// Imports a subtree from a host filesystem directory.
    pub fn import_files_from_path(
        &mut self,
        source: &Path,
        options: &ImportOptions,
    ) -> Result<FileListResult> {
        let mut result = FileListResult::default();
        let mut found = BTreeSet::new();
        self.import_fs(source, "", options, &mut result, &mut found)?;
        check_missing(options, &found)?;
        Ok(result)
    }

    fn import_cas(
        &mut self,
        source: &mut CasDir,
        prefix: &str,
        options: &ImportOptions,
        result: &mut FileListResult,
        found: &mut BTreeSet<String>,
    ) -> Result<()> {
        let names: Vec<String> = source.index_mut()?.keys().cloned().collect();
        for name in names {
            let relpath = join_rel(prefix, &name);
            let entry = source.index_mut()?.get_mut(&name).expect("name listed above").clone();
            match entry {
                CasEntry::Directory(mut subdir) => {
                    if !options.selects_below(&relpath) {
                        continue;
                    }
                    found.insert(relpath.clone());
                    let dest = self.ensure_subdir_for_import(&name, &relpath, result)?;
                    match dest {
                        Some(dest) => {
                            dest.import_cas(&mut subdir, &relpath, options, result, found)?
                        }
                        None => continue,
                    }
                }
                CasEntry::File { digest, executable } => {
                    if !options.selects(&relpath) {
                        continue;
                    }
                    found.insert(relpath.clone());
                    if self.check_replacement(&name, &relpath, result)? {
                        self.index_mut()?
                            .insert(name.clone(), CasEntry::File { digest, executable });
                        self.digest = None;
                        if options.report_written {
                            result.files_written.push(relpath);
                        }
                    }
                }
                CasEntry::Symlink { target } => {
                    if !options.selects(&relpath) {
                        continue;
                    }
                    found.insert(relpath.clone());
                    if self.check_replacement(&name, &relpath, result)? {
                        self.index_mut()?.insert(name.clone(), CasEntry::Symlink { target });
                        self.digest = None;
                        if options.report_written {
                            result.files_written.push(relpath);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn import_fs(
        &mut self,
        source: &Path,
        prefix: &str,
        options: &ImportOptions,
        result: &mut FileListResult,
        found: &mut BTreeSet<String>,
    ) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        let iter = fs::read_dir(source).map_err(|err| BstError::io(err, source))?;
        for entry in iter {
            let entry = entry.map_err(|err| BstError::io(err, source))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        for name in names {
            let relpath = join_rel(prefix, &name);
            let full_path = source.join(&name);
            let meta =
                fs::symlink_metadata(&full_path).map_err(|err| BstError::io(err, &full_path))?;
            let file_type = meta.file_type();
            if file_type.is_dir() {
                if !options.selects_below(&relpath) {
                    continue;
                }
                found.insert(relpath.clone());
                if let Some(dest) = self.ensure_subdir_for_import(&name, &relpath, result)? {
                    dest.import_fs(&full_path, &relpath, options, result, found)?;
                }
            } else if file_type.is_file() {
                if !options.selects(&relpath) {
                    continue;
                }
                found.insert(relpath.clone());
                if self.check_replacement(&name, &relpath, result)? {
                    let digest = self.cas.add_file(&full_path)?;
                    let executable = is_executable(&meta);
                    self.index_mut()?.insert(name.clone(), CasEntry::File { digest, executable });
                    self.digest = None;
                    if options.report_written {
                        result.files_written.push(relpath);
                    }
                }
            } else if file_type.is_symlink() {
                if !options.selects(&relpath) {
                    continue;
                }
                found.insert(relpath.clone());
                if self.check_replacement(&name, &relpath, result)? {
                    let target = fs::read_link(&full_path)
                        .map_err(|err| BstError::io(err, &full_path))?
                        .to_string_lossy()
                        .into_owned();
                    self.index_mut()?.insert(name.clone(), CasEntry::Symlink { target });
                    self.digest = None;
                    if options.report_written {
                        result.files_written.push(relpath);
                    }
                }
            } else {
                return Err(BstError::cas(format!(
                    "cannot import {}: unsupported file type",
                    full_path.display()
                ))
                .with_reason(reasons::UNSUPPORTED_FILE_TYPE));
            }
        }
        Ok(())
    }

    /// Ensures a directory entry exists at `name` for a recursive merge.
    ///
    /// An existing non-directory entry is replaced (and recorded as
    /// overwritten). Returns `None` when the merge target cannot be used.
    fn ensure_subdir_for_import(
        &mut self,
        name: &str,
        relpath: &str,
        result: &mut FileListResult,
    ) -> Result<Option<&mut CasDir>> {
        let cas = self.cas.clone();
        let existing_kind = match self.index_mut()?.get(name) {
            Some(CasEntry::Directory(_)) => ExistingKind::Directory,
            Some(_) => ExistingKind::Other,
            None => ExistingKind::Absent,
        };
        match existing_kind {
            ExistingKind::Directory => {}
            ExistingKind::Other => {
                result.overwritten.push(relpath.to_string());
                self.index_mut()?
                    .insert(name.to_string(), CasEntry::Directory(CasDir::empty(cas)));
                self.digest = None;
            }
            ExistingKind::Absent => {
                self.index_mut()?
                    .insert(name.to_string(), CasEntry::Directory(CasDir::empty(cas)));
                self.digest = None;
            }
            ExistingKind::EmptyDirectory => {
                unreachable!("existing_kind is never EmptyDirectory here")
            }
        }
        match self.index_mut()?.get_mut(name) {
            Some(CasEntry::Directory(dir)) => Ok(Some(dir)),
            _ => unreachable!("entry was just ensured to be a directory"),
        }
    }

    /// Whether a file or symlink may land at `name`, recording the
    /// overwrite/ignore outcome.
    fn check_replacement(
        &mut self,
        name: &str,
        relpath: &str,
        result: &mut FileListResult,
    ) -> Result<bool> {
        let existing_kind = match self.index_mut()?.get_mut(name) {
            None => ExistingKind::Absent,
            Some(CasEntry::Directory(dir)) => {
                if dir.is_empty()? {
                    ExistingKind::EmptyDirectory
                } else {
                    ExistingKind::Directory
                }
            }
            Some(_) => ExistingKind::Other,
        };
        match existing_kind {
            ExistingKind::Absent => Ok(true),
            ExistingKind::Other | ExistingKind::EmptyDirectory => {
                self.index_mut()?.remove(name);
                self.digest = None;
                result.overwritten.push(relpath.to_string());
                Ok(true)
            }
            ExistingKind::Directory => {
                result.ignored.push(relpath.to_string());
                Ok(false)
            }
        }
    }

    /// Materializes this tree below `dest` on the host filesystem.
    ///
    /// Regular files are hardlinked out of the store when `can_link` allows;
    /// directory modes are normalized to `rwxr-xr-x`.
    pub fn export_files(&mut self, dest: &Path, can_link: bool) -> Result<()> {
        let digest = self.digest()?;
        self.cas.checkout(dest, &digest, can_link)?;
        normalize_dir_modes(dest)
    }

    /// Yields every reachable path in deterministic order: per directory,
    /// symlinks sorted, then files sorted, then subdirectories depth first.
    /// A directory containing no files is itself yielded once.
    pub fn list_relative_paths(&mut self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.list_paths_into("", &mut out)?;
        Ok(out)
    }

    fn list_paths_into(&mut self, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let mut symlinks = Vec::new();
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for (name, entry) in self.index_mut()?.iter() {
            match entry {
                CasEntry::Symlink { .. } => symlinks.push(name.clone()),
                CasEntry::File { .. } => files.push(name.clone()),
                CasEntry::Directory(_) => dirs.push(name.clone()),
            }
        }
        for name in &symlinks {
            out.push(join_rel(prefix, name));
        }
        if files.is_empty() {
            out.push(if prefix.is_empty() { ".".to_string() } else { prefix.to_string() });
        }
        for name in &files {
            out.push(join_rel(prefix, name));
        }
        for name in dirs {
            let relpath = join_rel(prefix, &name);
            match self.index_mut()?.get_mut(&name) {
                Some(CasEntry::Directory(dir)) => dir.list_paths_into(&relpath, out)?,
                _ => unreachable!("directory listed above"),
            }
        }
        Ok(())
    }

    /// A flattened manifest of this tree, used for diffing.
    pub fn manifest(&mut self) -> Result<Manifest> {
        let mut manifest = Manifest::new();
        self.manifest_into("", &mut manifest)?;
        Ok(manifest)
    }

    fn manifest_into(&mut self, prefix: &str, manifest: &mut Manifest) -> Result<()> {
        let names: Vec<String> = self.index_mut()?.keys().cloned().collect();
        for name in names {
            let relpath = join_rel(prefix, &name);
            match self.index_mut()?.get_mut(&name).expect("name listed above") {
                CasEntry::File { digest, executable } => {
                    let entry =
                        ManifestEntry::File { hash: digest.hash.clone(), executable: *executable };
                    manifest.insert(relpath, entry);
                }
                CasEntry::Symlink { target } => {
                    let entry = ManifestEntry::Symlink { target: target.clone() };
                    manifest.insert(relpath, entry);
                }
                CasEntry::Directory(_) => {
                    manifest.insert(relpath.clone(), ManifestEntry::Directory);
                    match self.index_mut()?.get_mut(&name) {
                        Some(CasEntry::Directory(dir)) => dir.manifest_into(&relpath, manifest)?,
                        _ => unreachable!("directory listed above"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Diffs this tree against another.
    pub fn diff(&mut self, other: &mut CasDir) -> Result<DiffResult> {
        Ok(super::diff_manifests(&self.manifest()?, &other.manifest()?))
    }

    /// CAS does not store modification times; nothing to normalize.
    pub fn set_deterministic_mtime(&self) {}

    /// CAS does not store ownership; nothing to normalize.
    pub fn set_deterministic_user(&self) {}

    /// Looks up a file's content by path, without following symlinks.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut components = path_components(path);
        let name = components.pop().ok_or_else(|| {
            BstError::cas("empty path for file lookup").with_reason(reasons::NOT_FOUND)
        })?;
        let resolved = self.resolve_path(components, false, true)?;
        let dir = self.dir_at_mut(&resolved)?;
        let cas = dir.cas.clone();
        match dir.index_mut()?.get(&name) {
            Some(CasEntry::File { digest, .. }) => cas.read_object(digest),
            Some(_) => Err(BstError::cas(format!("{path:?} is not a regular file"))
                .with_reason(reasons::NOT_A_DIRECTORY)),
            None => Err(BstError::cas(format!("no entry called {name:?}"))
                .with_reason(reasons::NOT_FOUND)),
        }
    }
}

fn check_missing(options: &ImportOptions, found: &BTreeSet<String>) -> Result<()> {
    if options.ignore_missing {
        return Ok(());
    }
    if let Some(files) = &options.files {
        for file in files {
            if file == "." || file.is_empty() {
                continue;
            }
            // Parents of found paths were necessarily traversed.
            let is_parent = found.iter().any(|f| f.starts_with(&format!("{file}/")));
            if !found.contains(file) && !is_parent {
                return Err(BstError::cas(format!("import source is missing {file:?}"))
                    .with_reason(reasons::MISSING_SOURCE));
            }
        }
    }
    Ok(())
}

fn is_executable(meta: &fs::Metadata) -> bool {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o100 != 0
        } else {
            let _ = meta;
            false
        }
    }
}

fn normalize_dir_modes(root: &Path) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::PermissionsExt;
            for entry in walkdir::WalkDir::new(root).follow_links(false) {
                let entry = entry
                    .map_err(|err| BstError::cas(format!("failed to walk {}: {err}", root.display())))?;
                if entry.file_type().is_dir() {
                    fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o755))
                        .map_err(|err| BstError::io(err, entry.path().to_path_buf()))?;
                }
            }
            Ok(())
        } else {
            let _ = root;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdir::FsDir;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, Arc<CasCache>) {
        let tmp = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasCache::new(tmp.path().join("cas")).unwrap());
        (tmp, cas)
    }

    fn populate(tmp: &tempfile::TempDir, spec: &[(&str, &str)]) -> std::path::PathBuf {
        let src = tmp.path().join(format!("src-{}", spec.len()));
        for (path, content) in spec {
            let full = src.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        src
    }

    #[test]
    fn import_from_fs_and_read_back() {
        let (tmp, cas) = store();
        let src = populate(&tmp, &[("a", "1"), ("sub/b", "2")]);
        let mut dir = CasDir::empty(cas);
        let result = dir.import_files_from_path(&src, &ImportOptions::all()).unwrap();
        assert_eq!(result.files_written, vec!["a".to_string(), "sub/b".to_string()]);
        assert_eq!(dir.read_file("sub/b").unwrap(), b"2");
    }

    #[test]
    fn import_of_self_is_idempotent() {
        let (tmp, cas) = store();
        let src = populate(&tmp, &[("a", "1"), ("sub/b", "2")]);
        let mut dir = CasDir::empty(cas.clone());
        dir.import_files_from_path(&src, &ImportOptions::all()).unwrap();
        let before = dir.digest().unwrap();
        let listing_before = dir.list_relative_paths().unwrap();

        let mut other = CasDir::open(cas, before.clone());
        dir.import_files(&mut other, &ImportOptions::all()).unwrap();
        assert_eq!(dir.digest().unwrap(), before);
        assert_eq!(dir.list_relative_paths().unwrap(), listing_before);
    }

    #[test]
    fn disjoint_imports_commute() {
        let (tmp, cas) = store();
        let src_a = populate(&tmp, &[("a/x", "1")]);
        let src_b = populate(&tmp, &[("b/y", "2"), ("c", "3")]);

        let mut ab = CasDir::empty(cas.clone());
        ab.import_files_from_path(&src_a, &ImportOptions::all()).unwrap();
        ab.import_files_from_path(&src_b, &ImportOptions::all()).unwrap();

        let mut ba = CasDir::empty(cas);
        ba.import_files_from_path(&src_b, &ImportOptions::all()).unwrap();
        ba.import_files_from_path(&src_a, &ImportOptions::all()).unwrap();

        assert_eq!(ab.digest().unwrap(), ba.digest().unwrap());
    }

    #[test]
    fn file_replaces_file_and_reports_overwrite() {
        let (tmp, cas) = store();
        let first = populate(&tmp, &[("bin/tool", "old")]);
        let second = populate(&tmp, &[("bin/tool", "new"), ("bin/extra", "x")]);
        let mut dir = CasDir::empty(cas);
        dir.import_files_from_path(&first, &ImportOptions::all()).unwrap();
        let result = dir.import_files_from_path(&second, &ImportOptions::all()).unwrap();
        assert_eq!(result.overwritten, vec!["bin/tool".to_string()]);
        assert_eq!(dir.read_file("bin/tool").unwrap(), b"new");
    }

    #[test]
    fn file_over_empty_directory_overwrites_but_nonempty_is_ignored() {
        let (tmp, cas) = store();
        let mut dir = CasDir::empty(cas);
        dir.descend("empty", true).unwrap();
        dir.descend("full", true).unwrap();
        let content = populate(&tmp, &[("full/inner", "1")]);
        dir.import_files_from_path(&content, &ImportOptions::all()).unwrap();

        let incoming = populate(&tmp, &[("empty", "file"), ("full", "file")]);
        let result = dir.import_files_from_path(&incoming, &ImportOptions::all()).unwrap();
        assert_eq!(result.overwritten, vec!["empty".to_string()]);
        assert_eq!(result.ignored, vec!["full".to_string()]);
        assert_eq!(dir.read_file("empty").unwrap(), b"file");
        assert_eq!(dir.read_file("full/inner").unwrap(), b"1");
    }

    #[test]
    fn descend_follows_symlinks_and_detects_loops() {
        let (tmp, cas) = store();
        let src = tmp.path().join("links");
        fs::create_dir_all(src.join("real")).unwrap();
        fs::write(src.join("real/f"), "1").unwrap();
        crate::cas::make_symlink("real", &src.join("alias")).unwrap();
        crate::cas::make_symlink("loop-b", &src.join("loop-a")).unwrap();
        crate::cas::make_symlink("loop-a", &src.join("loop-b")).unwrap();

        let mut dir = CasDir::empty(cas);
        dir.import_files_from_path(&src, &ImportOptions::all()).unwrap();

        let sub = dir.descend("alias", false).unwrap();
        assert!(!sub.is_empty().unwrap());

        let err = dir.descend("loop-a", false).unwrap_err();
        assert_eq!(err.reason(), Some(reasons::SYMLINK_LOOP));

        let err = dir.descend("missing", false).unwrap_err();
        assert_eq!(err.reason(), Some(reasons::NOT_FOUND));

        let err = dir.descend("real/f", false).unwrap_err();
        assert_eq!(err.reason(), Some(reasons::NOT_A_DIRECTORY));
    }

    #[test]
    fn export_round_trips_through_the_filesystem() {
        let (tmp, cas) = store();
        let src = populate(&tmp, &[("a", "1"), ("deep/nested/b", "2")]);
        let mut dir = CasDir::empty(cas.clone());
        dir.import_files_from_path(&src, &ImportOptions::all()).unwrap();
        let digest = dir.digest().unwrap();

        let exported = tmp.path().join("exported");
        dir.export_files(&exported, true).unwrap();

        let mut round = CasDir::empty(cas);
        round.import_files_from_path(&exported, &ImportOptions::all()).unwrap();
        assert_eq!(round.digest().unwrap(), digest);
    }

    #[test]
    fn listing_is_deterministic_and_matches_fs_view() {
        let (tmp, cas) = store();
        let src = populate(&tmp, &[("z", "1"), ("a/inner", "2"), ("a/b/deep", "3")]);
        fs::create_dir_all(src.join("a/hollow")).unwrap();
        crate::cas::make_symlink("z", &src.join("link")).unwrap();

        let mut dir = CasDir::empty(cas);
        dir.import_files_from_path(&src, &ImportOptions::all()).unwrap();
        let cas_listing = dir.list_relative_paths().unwrap();

        let exported = tmp.path().join("exported");
        dir.export_files(&exported, false).unwrap();
        let fs_listing = FsDir::new(&exported).unwrap().list_relative_paths().unwrap();

        assert_eq!(cas_listing, fs_listing);
        assert_eq!(
            cas_listing,
            vec![
                "link".to_string(),
                "z".to_string(),
                "a/inner".to_string(),
                "a/b/deep".to_string(),
                "a/hollow".to_string(),
            ]
        );
    }

    #[test]
    fn partial_import_selects_listed_paths_only() {
        let (tmp, cas) = store();
        let src = populate(&tmp, &[("keep/a", "1"), ("drop/b", "2")]);
        let mut dir = CasDir::empty(cas);
        let options = ImportOptions::with_files(vec!["keep/a".to_string()]);
        dir.import_files_from_path(&src, &options).unwrap();
        assert!(dir.read_file("keep/a").is_ok());
        assert!(dir.read_file("drop/b").is_err());
    }

    #[test]
    fn partial_import_of_missing_path_fails_unless_ignored() {
        let (tmp, cas) = store();
        let src = populate(&tmp, &[("present", "1")]);
        let mut dir = CasDir::empty(cas);

        let options = ImportOptions::with_files(vec!["absent".to_string()]);
        let err = dir.import_files_from_path(&src, &options).unwrap_err();
        assert_eq!(err.reason(), Some(reasons::MISSING_SOURCE));

        let options = ImportOptions {
            files: Some(vec!["absent".to_string()]),
            ignore_missing: true,
            ..Default::default()
        };
        dir.import_files_from_path(&src, &options).unwrap();
    }
}
