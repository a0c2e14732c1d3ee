//! The host filesystem backed directory view.

use crate::{
    cas::make_symlink,
    error::{BstError, Result},
    utils,
    vdir::{
        join_rel, path_components, reasons, CasDir, DiffResult, FileListResult, ImportOptions,
        Manifest, ManifestEntry, MAX_SYMLINK_HOPS,
    },
};
use std::{
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

/// The fixed modification time applied by
/// [`FsDir::set_deterministic_mtime`].
const DETERMINISTIC_MTIME_SECS: u64 = 1_321_009_871;

/// A directory tree backed by a host filesystem path.
///
/// Operations are ordinary `stat`/`open`/`symlink` calls; symlink resolution
/// during [`FsDir::descend`] is performed manually so that targets can never
/// escape above the view's root.
#[derive(Clone, Debug)]
pub struct FsDir {
    root: PathBuf,
}

impl FsDir {
    /// Opens `path` as a directory view, creating it when missing.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        fs::create_dir_all(&root).map_err(|err| BstError::io(err, &root))?;
        Ok(Self { root })
    }

    /// The absolute host path backing this view.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Descends into the subdirectory at `path`, optionally creating the
    /// missing levels.
    ///
    /// Shares its observable semantics with [`CasDir::descend`]: symlinks
    /// resolve within the view's root with a hop budget, `..` clamps at the
    /// root, and the same machine readable reasons are reported.
    pub fn descend(&self, path: &str, create: bool) -> Result<FsDir> {
        self.resolve(path_components(path), create, true)
    }

    /// Like [`FsDir::descend`] but refusing absolute symlink targets.
    pub fn descend_no_absolute(&self, path: &str, create: bool) -> Result<FsDir> {
        self.resolve(path_components(path), create, false)
    }

    fn resolve(&self, components: Vec<String>, create: bool, allow_absolute: bool) -> Result<FsDir> {
        let mut queue: VecDeque<String> = components.into();
        let mut path: Vec<String> = Vec::new();
        let mut hops = 0usize;
        while let Some(component) = queue.pop_front() {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                path.pop();
                continue;
            }
            let mut full = self.root.clone();
            full.extend(&path);
            full.push(&component);
            match fs::symlink_metadata(&full) {
                Ok(meta) if meta.file_type().is_dir() => path.push(component),
                Ok(meta) if meta.file_type().is_symlink() => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(BstError::cas(format!(
                            "symlink {component:?} leads into a loop"
                        ))
                        .with_reason(reasons::SYMLINK_LOOP));
                    }
                    let target = fs::read_link(&full)
                        .map_err(|err| BstError::io(err, &full))?
                        .to_string_lossy()
                        .into_owned();
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
                Ok(_) => {
                    return Err(BstError::cas(format!(
                        "cannot descend into {component:?}, which is not a directory"
                    ))
                    .with_reason(reasons::NOT_A_DIRECTORY))
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if create {
                        fs::create_dir(&full).map_err(|err| BstError::io(err, &full))?;
                        path.push(component);
                    } else {
                        return Err(BstError::cas(format!("no entry called {component:?}"))
                            .with_reason(reasons::NOT_FOUND));
                    }
                }
                Err(err) => return Err(BstError::io(err, full)),
            }
        }
        let mut resolved = self.root.clone();
        resolved.extend(&path);
        Ok(FsDir { root: resolved })
    }

    /// Imports files from a host directory, hardlinking where allowed.
    ///
    /// The selected paths are processed in sorted order; an existing
    /// non-directory entry at a written name is replaced and reported in
    /// `overwritten`, a non-empty directory wins over an incoming file and
    /// the file lands in `ignored`.
    pub fn import_files(&self, source: &Path, options: &ImportOptions) -> Result<FileListResult> {
        let mut paths = match &options.files {
            Some(files) => files.clone(),
            None => FsDir::open_unchecked(source).list_relative_paths()?,
        };
        paths.sort();

        let mut result = FileListResult::default();
        for relpath in &paths {
            if relpath == "." || relpath.is_empty() {
                continue;
            }
            let srcpath = source.join(relpath);
            let destpath = self.root.join(relpath);

            let src_meta = match fs::symlink_metadata(&srcpath) {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if options.ignore_missing {
                        continue;
                    }
                    return Err(BstError::cas(format!("import source is missing {relpath:?}"))
                        .with_reason(reasons::MISSING_SOURCE));
                }
                Err(err) => return Err(BstError::io(err, srcpath)),
            };

            // Collect the overlap before touching the destination.
            let mut dest_was_dir = false;
            if let Ok(dest_meta) = fs::symlink_metadata(&destpath) {
                if dest_meta.file_type().is_dir() {
                    dest_was_dir = true;
                } else {
                    result.overwritten.push(relpath.clone());
                }
            }

            self.ensure_parent_dirs(relpath, &mut result)?;

            let file_type = src_meta.file_type();
            if file_type.is_dir() {
                match fs::symlink_metadata(&destpath) {
                    Ok(meta) if meta.file_type().is_dir() => {}
                    Ok(_) => {
                        fs::remove_file(&destpath).map_err(|err| BstError::io(err, &destpath))?;
                        fs::create_dir(&destpath).map_err(|err| BstError::io(err, &destpath))?;
                    }
                    Err(_) => {
                        fs::create_dir(&destpath).map_err(|err| BstError::io(err, &destpath))?;
                    }
                }
            } else if file_type.is_symlink() {
                if !safe_remove(&destpath)? {
                    result.ignored.push(relpath.clone());
                    continue;
                }
                if dest_was_dir {
                    // An empty directory made way for the symlink.
                    result.overwritten.push(relpath.clone());
                }
                let target = fs::read_link(&srcpath)
                    .map_err(|err| BstError::io(err, &srcpath))?
                    .to_string_lossy()
                    .into_owned();
                make_symlink(&target, &destpath)?;
                if options.report_written {
                    result.files_written.push(relpath.clone());
                }
            } else if file_type.is_file() {
                if !safe_remove(&destpath)? {
                    result.ignored.push(relpath.clone());
                    continue;
                }
                if dest_was_dir {
                    // An empty directory made way for the file.
                    result.overwritten.push(relpath.clone());
                }
                if options.can_link {
                    utils::hardlink_or_copy(&srcpath, &destpath)?;
                } else {
                    fs::copy(&srcpath, &destpath).map_err(|err| BstError::io(err, &destpath))?;
                }
                if options.report_written {
                    result.files_written.push(relpath.clone());
                }
            } else {
                return Err(BstError::cas(format!(
                    "cannot import {}: unsupported file type",
                    srcpath.display()
                ))
                .with_reason(reasons::UNSUPPORTED_FILE_TYPE));
            }
        }
        Ok(result)
    }

    /// Imports files from a CAS backed directory, hardlinking file content
    /// out of the object store where allowed.
    pub fn import_files_from_cas(
        &self,
        source: &mut CasDir,
        options: &ImportOptions,
    ) -> Result<FileListResult> {
        // Materialize the source below a scratch directory and run the
        // host-side import policy over it; file content stays hardlinked to
        // the store either way.
        let scratch = tempfile::tempdir_in(
            self.root.parent().unwrap_or(&self.root),
        )
        .map_err(|err| BstError::io(err, &self.root))?;
        source.export_files(scratch.path(), true)?;
        self.import_files(scratch.path(), options)
    }

    /// Exports this view's contents to `dest`.
    ///
    /// With `can_destroy` the tree is moved when the rename is possible;
    /// otherwise contents are copied (or hardlinked with `can_link`).
    /// Regular files lose their group/other write bits, parent directories
    /// receive `rwxr-xr-x`.
    pub fn export_files(&self, dest: &Path, can_link: bool, can_destroy: bool) -> Result<()> {
        if can_destroy && !dest.exists() {
            utils::create_parent_dir_all(dest)?;
            if fs::rename(&self.root, dest).is_ok() {
                normalize_export_modes(dest)?;
                return Ok(());
            }
        }
        let dest_dir = FsDir::new(dest)?;
        let options = ImportOptions { can_link, ..ImportOptions::default() };
        dest_dir.import_files(&self.root, &options)?;
        normalize_export_modes(dest)
    }

    /// Yields every reachable path in the same deterministic order as
    /// [`CasDir::list_relative_paths`].
    pub fn list_relative_paths(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.list_paths_into("", &mut out)?;
        Ok(out)
    }

    fn list_paths_into(&self, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let full = if prefix.is_empty() { self.root.clone() } else { self.root.join(prefix) };
        let (symlinks, files, dirs) = read_sorted_entries(&full)?;
        for name in &symlinks {
            out.push(join_rel(prefix, name));
        }
        if files.is_empty() {
            out.push(if prefix.is_empty() { ".".to_string() } else { prefix.to_string() });
        }
        for name in &files {
            out.push(join_rel(prefix, name));
        }
        for name in &dirs {
            self.list_paths_into(&join_rel(prefix, name), out)?;
        }
        Ok(())
    }

    /// A flattened manifest of this tree, hashing file content on the fly.
    pub fn manifest(&self) -> Result<Manifest> {
        let mut manifest = Manifest::new();
        self.manifest_into("", &mut manifest)?;
        Ok(manifest)
    }

    fn manifest_into(&self, prefix: &str, manifest: &mut Manifest) -> Result<()> {
        let full = if prefix.is_empty() { self.root.clone() } else { self.root.join(prefix) };
        let (symlinks, files, dirs) = read_sorted_entries(&full)?;
        for name in symlinks {
            let link = full.join(&name);
            let target = fs::read_link(&link)
                .map_err(|err| BstError::io(err, &link))?
                .to_string_lossy()
                .into_owned();
            manifest.insert(join_rel(prefix, &name), ManifestEntry::Symlink { target });
        }
        for name in files {
            let file = full.join(&name);
            let (hash, _) = utils::sha256_file(&file)?;
            let meta = fs::symlink_metadata(&file).map_err(|err| BstError::io(err, &file))?;
            manifest.insert(
                join_rel(prefix, &name),
                ManifestEntry::File { hash, executable: is_executable(&meta) },
            );
        }
        for name in dirs {
            let relpath = join_rel(prefix, &name);
            manifest.insert(relpath.clone(), ManifestEntry::Directory);
            self.manifest_into(&relpath, manifest)?;
        }
        Ok(())
    }

    /// Diffs this view against another filesystem view.
    pub fn diff(&self, other: &FsDir) -> Result<DiffResult> {
        Ok(super::diff_manifests(&self.manifest()?, &other.manifest()?))
    }

    /// Diffs this view against a CAS backed view.
    pub fn diff_cas(&self, other: &mut CasDir) -> Result<DiffResult> {
        Ok(super::diff_manifests(&self.manifest()?, &other.manifest()?))
    }

    /// Sets a fixed modification time on every regular file below the view.
    pub fn set_deterministic_mtime(&self) -> Result<()> {
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(DETERMINISTIC_MTIME_SECS);
        for entry in walkdir::WalkDir::new(&self.root).follow_links(false) {
            let entry = entry
                .map_err(|err| BstError::cas(format!("failed to walk {}: {err}", self.root.display())))?;
            if entry.file_type().is_file() {
                let file = fs::OpenOptions::new()
                    .append(true)
                    .open(entry.path())
                    .map_err(|err| BstError::io(err, entry.path().to_path_buf()))?;
                file.set_modified(stamp)
                    .map_err(|err| BstError::io(err, entry.path().to_path_buf()))?;
            }
        }
        Ok(())
    }

    /// Normalizes file ownership below the view.
    ///
    /// Everything staged by this process is already owned by its effective
    /// user, so there is nothing to change here; running builds as another
    /// user is the sandbox implementation's concern.
    pub fn set_deterministic_user(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the directory has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let mut iter = fs::read_dir(&self.root).map_err(|err| BstError::io(err, &self.root))?;
        Ok(iter.next().is_none())
    }

    /// Creates the ancestors of `relpath`, replacing any non-directory
    /// entry in the way and recording the replacement as an overwrite.
    fn ensure_parent_dirs(&self, relpath: &str, result: &mut FileListResult) -> Result<()> {
        let components = path_components(relpath);
        let mut current = self.root.clone();
        let mut prefix = String::new();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            current.push(component);
            prefix = join_rel(&prefix, component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_dir() => {}
                Ok(_) => {
                    fs::remove_file(&current).map_err(|err| BstError::io(err, &current))?;
                    fs::create_dir(&current).map_err(|err| BstError::io(err, &current))?;
                    result.overwritten.push(prefix.clone());
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&current).map_err(|err| BstError::io(err, &current))?;
                }
                Err(err) => return Err(BstError::io(err, &current)),
            }
        }
        Ok(())
    }

    fn open_unchecked(path: &Path) -> FsDir {
        FsDir { root: path.to_path_buf() }
    }
}

/// Removes whatever sits at `path` so a file or symlink can land there.
///
/// Returns `false` (leaving the path alone) when it is a non-empty
/// directory.
fn safe_remove(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(BstError::io(err, path)),
        Ok(meta) if meta.file_type().is_dir() => {
            let mut iter = fs::read_dir(path).map_err(|err| BstError::io(err, path))?;
            if iter.next().is_some() {
                return Ok(false);
            }
            fs::remove_dir(path).map_err(|err| BstError::io(err, path))?;
            Ok(true)
        }
        Ok(_) => {
            fs::remove_file(path).map_err(|err| BstError::io(err, path))?;
            Ok(true)
        }
    }
}

fn read_sorted_entries(dir: &Path) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let mut symlinks = Vec::new();
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let iter = fs::read_dir(dir).map_err(|err| BstError::io(err, dir))?;
    for entry in iter {
        let entry = entry.map_err(|err| BstError::io(err, dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type().map_err(|err| BstError::io(err, dir))?;
        if file_type.is_symlink() {
            symlinks.push(name);
        } else if file_type.is_dir() {
            dirs.push(name);
        } else {
            files.push(name);
        }
    }
    symlinks.sort();
    files.sort();
    dirs.sort();
    Ok((symlinks, files, dirs))
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

fn normalize_export_modes(root: &Path) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::PermissionsExt;
            for entry in walkdir::WalkDir::new(root).follow_links(false) {
                let entry = entry
                    .map_err(|err| BstError::cas(format!("failed to walk {}: {err}", root.display())))?;
                let file_type = entry.file_type();
                if file_type.is_symlink() {
                    continue;
                }
                let path = entry.path();
                if file_type.is_dir() {
                    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
                        .map_err(|err| BstError::io(err, path.to_path_buf()))?;
                } else {
                    let meta = fs::symlink_metadata(path)
                        .map_err(|err| BstError::io(err, path.to_path_buf()))?;
                    let mode = meta.permissions().mode() & !0o022;
                    fs::set_permissions(path, fs::Permissions::from_mode(mode))
                        .map_err(|err| BstError::io(err, path.to_path_buf()))?;
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
    use pretty_assertions::assert_eq;

    fn populate(root: &Path, spec: &[(&str, &str)]) {
        for (path, content) in spec {
            let full = root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    #[test]
    fn import_links_files_and_reports_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        populate(&src, &[("bin/tool", "v2"), ("etc/conf", "c")]);
        let dest = FsDir::new(tmp.path().join("dest")).unwrap();
        populate(dest.path(), &[("bin/tool", "v1")]);

        let result = dest.import_files(&src, &ImportOptions::linked()).unwrap();
        assert_eq!(result.overwritten, vec!["bin/tool".to_string()]);
        assert_eq!(fs::read(dest.path().join("bin/tool")).unwrap(), b"v2");
        assert_eq!(fs::read(dest.path().join("etc/conf")).unwrap(), b"c");
    }

    #[test]
    fn import_refuses_to_replace_nonempty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        populate(&src, &[("target", "file")]);
        let dest = FsDir::new(tmp.path().join("dest")).unwrap();
        populate(dest.path(), &[("target/keep", "k")]);

        let result = dest.import_files(&src, &ImportOptions::all()).unwrap();
        assert_eq!(result.ignored, vec!["target".to_string()]);
        assert_eq!(fs::read(dest.path().join("target/keep")).unwrap(), b"k");
    }

    #[test]
    fn symlinks_are_copied_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        make_symlink("/usr/lib/libfoo.so", &src.join("libfoo.so")).unwrap();
        let dest = FsDir::new(tmp.path().join("dest")).unwrap();

        dest.import_files(&src, &ImportOptions::all()).unwrap();
        assert_eq!(
            fs::read_link(dest.path().join("libfoo.so")).unwrap(),
            PathBuf::from("/usr/lib/libfoo.so")
        );
    }

    #[test]
    fn descend_resolves_symlinks_within_the_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = FsDir::new(tmp.path().join("root")).unwrap();
        populate(root.path(), &[("real/data", "d")]);
        make_symlink("real", &root.path().join("alias")).unwrap();
        make_symlink("/real", &root.path().join("abs")).unwrap();

        let sub = root.descend("alias", false).unwrap();
        assert!(sub.path().ends_with("real"));

        // Absolute targets re-anchor at the view root by default.
        let sub = root.descend("abs", false).unwrap();
        assert!(sub.path().ends_with("real"));

        let err = root.descend_no_absolute("abs", false).unwrap_err();
        assert_eq!(err.reason(), Some(reasons::ABSOLUTE_ESCAPE));
    }

    #[test]
    fn descend_create_builds_missing_levels() {
        let tmp = tempfile::tempdir().unwrap();
        let root = FsDir::new(tmp.path().join("root")).unwrap();
        let sub = root.descend("a/b/c", true).unwrap();
        assert!(sub.path().is_dir());
        assert_eq!(root.descend("a/b/c", false).unwrap().path(), sub.path());
    }

    #[test]
    fn export_normalizes_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = FsDir::new(tmp.path().join("root")).unwrap();
        populate(root.path(), &[("file", "x")]);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root.path().join("file"), fs::Permissions::from_mode(0o666))
                .unwrap();
        }

        let dest = tmp.path().join("out");
        root.export_files(&dest, false, false).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::symlink_metadata(dest.join("file")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
        assert_eq!(fs::read(dest.join("file")).unwrap(), b"x");
    }

    #[test]
    fn listing_yields_empty_directories_once() {
        let tmp = tempfile::tempdir().unwrap();
        let root = FsDir::new(tmp.path().join("root")).unwrap();
        populate(root.path(), &[("top", "1")]);
        fs::create_dir_all(root.path().join("hollow/inner")).unwrap();

        assert_eq!(
            root.list_relative_paths().unwrap(),
            vec!["top".to_string(), "hollow".to_string(), "hollow/inner".to_string()]
        );
    }

    #[test]
    fn diff_detects_content_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let a = FsDir::new(tmp.path().join("a")).unwrap();
        let b = FsDir::new(tmp.path().join("b")).unwrap();
        populate(a.path(), &[("same", "s"), ("changed", "1"), ("removed", "r")]);
        populate(b.path(), &[("same", "s"), ("changed", "2"), ("added", "a")]);

        let diff = a.diff(&b).unwrap();
        assert_eq!(diff.added, vec!["added".to_string()]);
        assert_eq!(diff.removed, vec!["removed".to_string()]);
        assert_eq!(diff.modified, vec!["changed".to_string()]);
    }
}
