//! The content addressed object store.
//!
//! Blobs live under `objects/<hh>/<rest>`, keyed by the SHA-256 of their
//! content; insertion is atomic (write to `tmp/`, hardlink into place) and an
//! `EEXIST` on the link is success since equal names imply equal bytes. The
//! only mutable state is the ref index under `refs/heads/`, written with a
//! temp file + rename so concurrent writers can never produce a torn ref.

use crate::{
    error::{BstError, Result},
    utils,
};
use std::{
    collections::BTreeSet,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

mod digest;
pub use digest::Digest;

mod tree;
pub use tree::{DirectoryNode, FileNode, SymlinkNode, Tree, TreeEntry};

/// The local content addressed store.
///
/// All methods take `&self`; the store is safe to share across worker
/// threads and across concurrent processes on the same host.
#[derive(Clone, Debug)]
pub struct CasCache {
    casdir: PathBuf,
}

impl CasCache {
    /// Opens (and lays out) the store below `casdir`.
    pub fn new(casdir: impl Into<PathBuf>) -> Result<Self> {
        let casdir = casdir.into();
        for sub in ["objects", "refs/heads", "tmp"] {
            let dir = casdir.join(sub);
            fs::create_dir_all(&dir).map_err(|err| BstError::io(err, dir))?;
        }
        Ok(Self { casdir })
    }

    /// The root directory of the store.
    pub fn directory(&self) -> &Path {
        &self.casdir
    }

    fn objects_dir(&self) -> PathBuf {
        self.casdir.join("objects")
    }

    fn refs_dir(&self) -> PathBuf {
        self.casdir.join("refs/heads")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.casdir.join("tmp")
    }

    /// The path a blob with the given digest lives at.
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        let (prefix, rest) = digest.split_hash();
        self.objects_dir().join(prefix).join(rest)
    }

    /// Whether the blob for `digest` is present.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path(digest).exists()
    }

    /// Hashes and stores an in-memory buffer.
    pub fn add_bytes(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(bytes);
        self.place_object(&digest, |out| out.write_all(bytes))?;
        Ok(digest)
    }

    /// Hashes and stores the file at `path`.
    ///
    /// The content is streamed through the hasher and a fresh temp file in
    /// one pass, so a concurrent mutation of the input can never leave a
    /// blob whose name disagrees with its content.
    pub fn add_file(&self, path: &Path) -> Result<Digest> {
        use sha2::Digest as _;

        let mut input = fs::File::open(path).map_err(|err| BstError::io(err, path))?;
        let mut tmp = tempfile::NamedTempFile::new_in(self.tmp_dir())
            .map_err(|err| BstError::io(err, self.tmp_dir()))?;
        let mut hasher = sha2::Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size_bytes = 0u64;
        loop {
            let n = io::Read::read(&mut input, &mut buf).map_err(|err| BstError::io(err, path))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.as_file_mut().write_all(&buf[..n]).map_err(|err| BstError::io(err, path))?;
            size_bytes += n as u64;
        }
        tmp.as_file_mut().flush().map_err(|err| BstError::io(err, path))?;

        let digest = Digest { hash: hex::encode(hasher.finalize()), size_bytes };
        let object_path = self.object_path(&digest);
        if object_path.exists() {
            return Ok(digest);
        }
        utils::create_parent_dir_all(&object_path)?;
        match fs::hard_link(tmp.path(), &object_path) {
            Ok(()) => Ok(digest),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(digest),
            Err(err) => Err(BstError::io(err, object_path)),
        }
    }

    fn place_object(
        &self,
        digest: &Digest,
        write: impl FnOnce(&mut fs::File) -> io::Result<()>,
    ) -> Result<()> {
        let object_path = self.object_path(digest);
        if object_path.exists() {
            return Ok(());
        }
        let mut tmp = tempfile::NamedTempFile::new_in(self.tmp_dir())
            .map_err(|err| BstError::io(err, self.tmp_dir()))?;
        write(tmp.as_file_mut()).map_err(|err| BstError::io(err, &object_path))?;
        tmp.as_file_mut().flush().map_err(|err| BstError::io(err, &object_path))?;
        utils::create_parent_dir_all(&object_path)?;
        match fs::hard_link(tmp.path(), &object_path) {
            Ok(()) => Ok(()),
            // Another writer linked the same content first.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(BstError::io(err, object_path)),
        }
    }

    /// Reads a blob back into memory.
    pub fn read_object(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => BstError::cas(format!("missing object {digest}"))
                .with_reason("missing-object"),
            _ => BstError::io(err, path),
        })
    }

    /// Stores a directory object, returning its digest.
    pub fn add_tree(&self, tree: &Tree) -> Result<Digest> {
        self.add_bytes(&tree.encode()?)
    }

    /// Reads a directory object back.
    pub fn read_tree(&self, digest: &Digest) -> Result<Tree> {
        Tree::decode(&self.read_object(digest)?)
    }

    fn ref_path(&self, ref_name: &str) -> PathBuf {
        self.refs_dir().join(ref_name)
    }

    /// Creates or replaces a ref, atomically.
    pub fn set_ref(&self, ref_name: &str, digest: &Digest) -> Result<()> {
        trace!(ref_name, %digest, "set ref");
        utils::save_file_atomic(&self.ref_path(ref_name), &serde_json::to_vec(digest)?)
    }

    /// Resolves a ref to the digest it points at.
    pub fn resolve_ref(&self, ref_name: &str) -> Result<Digest> {
        let path = self.ref_path(ref_name);
        let bytes = fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => {
                BstError::cas(format!("attempt to access unavailable ref {ref_name}"))
                    .with_reason("missing-ref")
            }
            _ => BstError::io(err, path),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Whether the given ref exists.
    pub fn has_ref(&self, ref_name: &str) -> bool {
        self.ref_path(ref_name).exists()
    }

    /// Bumps the ref's timestamp so LRU listings consider it hot.
    ///
    /// Best effort: timestamp collisions with concurrent sessions are
    /// harmless.
    pub fn update_atime(&self, ref_name: &str) -> Result<()> {
        let digest = self.resolve_ref(ref_name)?;
        self.set_ref(ref_name, &digest)
    }

    /// Lists all refs, least recently used first.
    pub fn list_refs(&self) -> Result<Vec<String>> {
        let refs_dir = self.refs_dir();
        let mut refs: Vec<(SystemTime, String)> = Vec::new();
        for entry in walkdir::WalkDir::new(&refs_dir).follow_links(false) {
            let entry =
                entry.map_err(|err| BstError::cas(format!("failed to list refs: {err}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|err| BstError::cas(format!("failed to stat ref: {err}")))?;
            let mtime = meta
                .modified()
                .map_err(|err| BstError::cas(format!("failed to stat ref: {err}")))?;
            let name = entry
                .path()
                .strip_prefix(&refs_dir)
                .expect("ref path below refs dir")
                .to_string_lossy()
                .into_owned();
            refs.push((mtime, name));
        }
        refs.sort();
        Ok(refs.into_iter().map(|(_, name)| name).collect())
    }

    /// Removes a ref and prunes the objects that became unreachable.
    ///
    /// Returns the number of bytes freed.
    pub fn remove_ref(&self, ref_name: &str) -> Result<u64> {
        let path = self.ref_path(ref_name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(BstError::cas(format!("attempt to remove unavailable ref {ref_name}"))
                    .with_reason("missing-ref"))
            }
            Err(err) => return Err(BstError::io(err, path)),
        }
        self.prune()
    }

    /// Deletes every object unreachable from the ref index.
    ///
    /// Returns the number of bytes freed.
    pub fn prune(&self) -> Result<u64> {
        let mut reachable = BTreeSet::new();
        for ref_name in self.list_refs()? {
            let digest = self.resolve_ref(&ref_name)?;
            self.mark_reachable(&digest, &mut reachable)?;
        }

        let mut freed = 0u64;
        for entry in walkdir::WalkDir::new(self.objects_dir()).follow_links(false) {
            let entry =
                entry.map_err(|err| BstError::cas(format!("failed to walk objects: {err}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let hash = {
                let prefix = entry
                    .path()
                    .parent()
                    .and_then(Path::file_name)
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{}{}", prefix, entry.file_name().to_string_lossy())
            };
            if !reachable.contains(&hash) {
                let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
                fs::remove_file(entry.path())
                    .map_err(|err| BstError::io(err, entry.path().to_path_buf()))?;
                freed += size;
            }
        }
        debug!(freed, "pruned unreachable objects");
        Ok(freed)
    }

    fn mark_reachable(&self, digest: &Digest, reachable: &mut BTreeSet<String>) -> Result<()> {
        if !reachable.insert(digest.hash.clone()) {
            return Ok(());
        }
        // Objects may legitimately be absent (partial pull); only recurse
        // through trees that are present.
        if !self.contains(digest) {
            return Ok(());
        }
        if let Ok(tree) = self.read_tree(digest) {
            for file in &tree.files {
                reachable.insert(file.digest.hash.clone());
            }
            for dir in &tree.directories {
                self.mark_reachable(&dir.digest, reachable)?;
            }
        }
        Ok(())
    }

    /// All digests reachable from a directory object, the root tree
    /// included, in parent-before-child order.
    pub fn walk_digests(&self, root: &Digest) -> Result<Vec<Digest>> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        self.walk_digests_inner(root, &mut out, &mut seen)?;
        Ok(out)
    }

    fn walk_digests_inner(
        &self,
        digest: &Digest,
        out: &mut Vec<Digest>,
        seen: &mut BTreeSet<String>,
    ) -> Result<()> {
        if !seen.insert(digest.hash.clone()) {
            return Ok(());
        }
        out.push(digest.clone());
        let tree = self.read_tree(digest)?;
        for file in &tree.files {
            if seen.insert(file.digest.hash.clone()) {
                out.push(file.digest.clone());
            }
        }
        for dir in &tree.directories {
            self.walk_digests_inner(&dir.digest, out, seen)?;
        }
        Ok(())
    }

    /// Total byte size of everything reachable from `root`, deduplicated.
    pub fn tree_size(&self, root: &Digest) -> Result<u64> {
        Ok(self.walk_digests(root)?.iter().map(|digest| digest.size_bytes).sum())
    }

    /// Apparent size of the whole object store.
    pub fn total_size(&self) -> Result<u64> {
        utils::dir_size(&self.objects_dir())
    }

    /// Imports a host filesystem tree, returning the digest of the resulting
    /// directory object.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn import_tree(&self, path: &Path) -> Result<Digest> {
        let mut names: Vec<(String, PathBuf)> = Vec::new();
        let iter = fs::read_dir(path).map_err(|err| BstError::io(err, path))?;
        for entry in iter {
            let entry = entry.map_err(|err| BstError::io(err, path))?;
            names.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
        names.sort();

        let mut tree = Tree::default();
        for (name, full_path) in names {
            let meta = fs::symlink_metadata(&full_path).map_err(|err| BstError::io(err, &full_path))?;
            let file_type = meta.file_type();
            if file_type.is_dir() {
                tree.directories
                    .push(DirectoryNode { name, digest: self.import_tree(&full_path)? });
            } else if file_type.is_symlink() {
                let target = fs::read_link(&full_path)
                    .map_err(|err| BstError::io(err, &full_path))?
                    .to_string_lossy()
                    .into_owned();
                tree.symlinks.push(SymlinkNode { name, target });
            } else if file_type.is_file() {
                let digest = self.add_file(&full_path)?;
                tree.files.push(FileNode { name, digest, is_executable: is_executable(&meta) });
            } else {
                return Err(BstError::cas(format!(
                    "cannot import {}: unsupported file type",
                    full_path.display()
                ))
                .with_reason("unsupported-file-type"));
            }
        }
        self.add_tree(&tree)
    }

    /// Materializes a directory object below `dest` on the host filesystem.
    ///
    /// Regular files are hardlinked out of the object store when `can_link`
    /// allows it, falling back to copies across filesystems.
    pub fn checkout(&self, dest: &Path, root: &Digest, can_link: bool) -> Result<()> {
        fs::create_dir_all(dest).map_err(|err| BstError::io(err, dest))?;
        let tree = self.read_tree(root)?;

        for file in &tree.files {
            let target = dest.join(&file.name);
            let object = self.object_path(&file.digest);
            if can_link {
                utils::hardlink_or_copy(&object, &target)?;
            } else {
                fs::copy(&object, &target).map_err(|err| BstError::io(err, &target))?;
            }
            set_checkout_mode(&target, file.is_executable)?;
        }
        for dir in &tree.directories {
            self.checkout(&dest.join(&dir.name), &dir.digest, can_link)?;
        }
        for symlink in &tree.symlinks {
            let target = dest.join(&symlink.name);
            make_symlink(&symlink.target, &target)?;
        }
        Ok(())
    }
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

fn set_checkout_mode(path: &Path, executable: bool) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::PermissionsExt;
            let mode = if executable { 0o755 } else { 0o644 };
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|err| BstError::io(err, path))
        } else {
            let _ = (path, executable);
            Ok(())
        }
    }
}

pub(crate) fn make_symlink(target: &str, link: &Path) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            match std::os::unix::fs::symlink(target, link) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    fs::remove_file(link).map_err(|err| BstError::io(err, link))?;
                    std::os::unix::fs::symlink(target, link).map_err(|err| BstError::io(err, link))
                }
                Err(err) => Err(BstError::io(err, link)),
            }
        } else {
            let _ = target;
            Err(BstError::cas(format!("cannot create symlink {}: unsupported on this host", link.display()))
                .with_reason("unsupported-file-type"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, CasCache) {
        let tmp = tempfile::tempdir().unwrap();
        let cas = CasCache::new(tmp.path().join("cas")).unwrap();
        (tmp, cas)
    }

    #[test]
    fn add_bytes_round_trips() {
        let (_tmp, cas) = store();
        let digest = cas.add_bytes(b"payload").unwrap();
        assert_eq!(digest.hash, utils::sha256_hex(b"payload"));
        assert!(cas.contains(&digest));
        assert_eq!(cas.read_object(&digest).unwrap(), b"payload");
    }

    #[test]
    fn adding_equal_content_twice_is_idempotent() {
        let (_tmp, cas) = store();
        let first = cas.add_bytes(b"same").unwrap();
        let second = cas.add_bytes(b"same").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn refs_resolve_and_misses_are_typed() {
        let (_tmp, cas) = store();
        let digest = cas.add_bytes(b"blob").unwrap();
        cas.set_ref("proj/elem/key", &digest).unwrap();
        assert_eq!(cas.resolve_ref("proj/elem/key").unwrap(), digest);

        let err = cas.resolve_ref("proj/elem/other").unwrap_err();
        assert_eq!(err.reason(), Some("missing-ref"));
    }

    #[test]
    fn list_refs_orders_least_recently_used_first() {
        let (_tmp, cas) = store();
        let digest = cas.add_bytes(b"blob").unwrap();
        cas.set_ref("p/a/1", &digest).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        cas.set_ref("p/b/2", &digest).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        cas.update_atime("p/a/1").unwrap();

        let refs = cas.list_refs().unwrap();
        assert_eq!(refs, vec!["p/b/2".to_string(), "p/a/1".to_string()]);
    }

    #[test]
    fn import_checkout_round_trip() {
        let (tmp, cas) = store();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a"), b"1").unwrap();
        fs::write(src.join("sub/b"), b"2").unwrap();
        make_symlink("a", &src.join("link")).unwrap();

        let digest = cas.import_tree(&src).unwrap();
        let dest = tmp.path().join("dest");
        cas.checkout(&dest, &digest, true).unwrap();

        assert_eq!(fs::read(dest.join("a")).unwrap(), b"1");
        assert_eq!(fs::read(dest.join("sub/b")).unwrap(), b"2");
        assert_eq!(fs::read_link(dest.join("link")).unwrap(), PathBuf::from("a"));

        // The re-import of the checkout hashes identically.
        assert_eq!(cas.import_tree(&dest).unwrap(), digest);
    }

    #[test]
    fn remove_ref_prunes_unreachable_objects() {
        let (tmp, cas) = store();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a"), vec![7u8; 512]).unwrap();
        let digest = cas.import_tree(&src).unwrap();
        cas.set_ref("p/e/k", &digest).unwrap();

        let freed = cas.remove_ref("p/e/k").unwrap();
        assert!(freed >= 512);
        assert!(!cas.contains(&digest));
    }

    #[test]
    fn prune_keeps_reachable_objects() {
        let (tmp, cas) = store();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a"), b"keep me").unwrap();
        let digest = cas.import_tree(&src).unwrap();
        cas.set_ref("p/e/k", &digest).unwrap();

        let orphan = cas.add_bytes(b"orphan").unwrap();
        let freed = cas.prune().unwrap();
        assert!(freed > 0);
        assert!(!cas.contains(&orphan));
        assert!(cas.contains(&digest));
        assert_eq!(cas.resolve_ref("p/e/k").unwrap(), digest);
    }
}
