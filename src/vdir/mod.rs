//! Two interchangeable views over a directory tree.
//!
//! [`CasDir`] walks a CAS backed Merkle tree, [`FsDir`] walks a host
//! filesystem directory. Both expose the same observable semantics for
//! descending, importing, exporting, diffing and listing, which is what
//! allows staging code to be written once against either view.

use std::collections::BTreeMap;

mod cas_dir;
pub use cas_dir::CasDir;

mod fs_dir;
pub use fs_dir::FsDir;

/// Maximum number of symlink hops resolved while descending before the walk
/// is declared a loop.
const MAX_SYMLINK_HOPS: usize = 64;

/// Machine readable reasons attached to virtual directory errors.
pub mod reasons {
    pub const NOT_A_DIRECTORY: &str = "not-a-directory";
    pub const SYMLINK_LOOP: &str = "symlink-loop";
    pub const ABSOLUTE_ESCAPE: &str = "absolute-escape";
    pub const NOT_FOUND: &str = "not-found";
    pub const UNSUPPORTED_FILE_TYPE: &str = "unsupported-file-type";
    pub const MISSING_SOURCE: &str = "missing-source";
}

/// The result of an operation which ran over a list of files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileListResult {
    /// Every file written to the target directory.
    pub files_written: Vec<String>,
    /// Files which replaced an existing entry at the same name.
    pub overwritten: Vec<String>,
    /// Files which were skipped because they would have replaced a
    /// non-empty directory.
    pub ignored: Vec<String>,
}

impl FileListResult {
    pub fn combine(&mut self, other: FileListResult) {
        self.files_written.extend(other.files_written);
        self.overwritten.extend(other.overwritten);
        self.ignored.extend(other.ignored);
    }
}

/// Options accepted by `import_files` on both views.
#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    /// Import only these source-relative paths; `None` imports everything.
    pub files: Option<Vec<String>>,
    /// Skip paths from `files` which are absent in the source instead of
    /// failing.
    pub ignore_missing: bool,
    /// Populate [`FileListResult::files_written`].
    pub report_written: bool,
    /// Allow hardlinks instead of copies where the implementation supports
    /// them (same filesystem, host backed target).
    pub can_link: bool,
}

impl ImportOptions {
    pub fn all() -> Self {
        Self { report_written: true, ..Default::default() }
    }

    pub fn linked() -> Self {
        Self { report_written: true, can_link: true, ..Default::default() }
    }

    pub fn with_files(files: Vec<String>) -> Self {
        Self { files: Some(files), report_written: true, ..Default::default() }
    }

    pub(crate) fn selects(&self, path: &str) -> bool {
        match &self.files {
            None => true,
            Some(files) => files.iter().any(|f| f == path),
        }
    }

    pub(crate) fn selects_below(&self, dir_path: &str) -> bool {
        match &self.files {
            None => true,
            Some(files) => {
                let prefix = format!("{dir_path}/");
                files.iter().any(|f| f == dir_path || f.starts_with(&prefix))
            }
        }
    }
}

/// One entry of a flattened directory manifest, keyed by relative path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestEntry {
    File { hash: String, executable: bool },
    Symlink { target: String },
    Directory,
}

/// A flattened view of a tree: relative path to entry, sorted by path.
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// The outcome of diffing two directory views.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

/// Diffs two manifests.
///
/// Files differ iff their content digests differ, symlinks iff their target
/// strings differ. Directory markers only contribute indirectly, through the
/// paths below them.
pub fn diff_manifests(a: &Manifest, b: &Manifest) -> DiffResult {
    let mut result = DiffResult::default();
    for (path, entry) in a {
        if matches!(entry, ManifestEntry::Directory) {
            continue;
        }
        match b.get(path) {
            None => result.removed.push(path.clone()),
            Some(other) if other == entry => {}
            Some(_) => result.modified.push(path.clone()),
        }
    }
    for (path, entry) in b {
        if matches!(entry, ManifestEntry::Directory) {
            continue;
        }
        if !a.contains_key(path) {
            result.added.push(path.clone());
        }
    }
    result
}

pub(crate) fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Splits a path spec into non-empty components, ignoring leading slashes
/// and `.` segments the way `descend` consumers pass them in.
pub(crate) fn path_components(path: &str) -> Vec<String> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(hash: &str) -> ManifestEntry {
        ManifestEntry::File { hash: hash.into(), executable: false }
    }

    #[test]
    fn diff_reports_added_removed_modified() {
        let mut a = Manifest::new();
        a.insert("keep".into(), file("h1"));
        a.insert("gone".into(), file("h2"));
        a.insert("changed".into(), file("h3"));
        let mut b = Manifest::new();
        b.insert("keep".into(), file("h1"));
        b.insert("changed".into(), file("h4"));
        b.insert("new".into(), file("h5"));

        let diff = diff_manifests(&a, &b);
        assert_eq!(diff.added, vec!["new".to_string()]);
        assert_eq!(diff.removed, vec!["gone".to_string()]);
        assert_eq!(diff.modified, vec!["changed".to_string()]);
    }

    #[test]
    fn symlinks_compare_by_target_string() {
        let mut a = Manifest::new();
        a.insert("link".into(), ManifestEntry::Symlink { target: "x".into() });
        let mut b = Manifest::new();
        b.insert("link".into(), ManifestEntry::Symlink { target: "y".into() });
        assert_eq!(diff_manifests(&a, &b).modified, vec!["link".to_string()]);
    }

    #[test]
    fn import_options_select_paths_and_subtrees() {
        let opts = ImportOptions::with_files(vec!["a/b/c".into(), "d".into()]);
        assert!(opts.selects("d"));
        assert!(!opts.selects("a/b"));
        assert!(opts.selects_below("a"));
        assert!(opts.selects_below("a/b"));
        assert!(!opts.selects_below("x"));
    }

    #[test]
    fn path_components_drop_empty_segments() {
        assert_eq!(path_components("/usr//bin/."), vec!["usr".to_string(), "bin".to_string()]);
        assert!(path_components("/").is_empty());
    }
}
