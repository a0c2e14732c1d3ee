//! The serialized directory object forming the nodes of the Merkle tree.

use crate::{
    cas::Digest,
    error::{BstError, Result},
};
use serde::{Deserialize, Serialize};

/// A regular file entry in a [`Tree`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

/// A subdirectory entry; the digest addresses another serialized [`Tree`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

/// A symlink entry. The target is an opaque path string, never resolved at
/// storage time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkNode {
    pub name: String,
    pub target: String,
}

/// One directory level of the Merkle tree.
///
/// All three lists are sorted by name and names are unique across the lists;
/// [`Tree::encode`] enforces this so that a tree's digest is a deterministic
/// function of its contents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    #[serde(default)]
    pub files: Vec<FileNode>,
    #[serde(default)]
    pub directories: Vec<DirectoryNode>,
    #[serde(default)]
    pub symlinks: Vec<SymlinkNode>,
}

impl Tree {
    /// Serializes the tree into its canonical byte form.
    ///
    /// Fails when entry names are unsorted or duplicated, since that would
    /// make equal directory contents hash differently.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a tree from its canonical byte form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let tree: Tree = serde_json::from_slice(bytes)?;
        tree.validate()?;
        Ok(tree)
    }

    /// The digest of this tree's canonical serialization.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of_bytes(self.encode()?))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty() && self.symlinks.is_empty()
    }

    /// Looks up an entry by basename.
    pub fn find(&self, name: &str) -> Option<TreeEntry<'_>> {
        if let Ok(i) = self.files.binary_search_by(|f| f.name.as_str().cmp(name)) {
            return Some(TreeEntry::File(&self.files[i]));
        }
        if let Ok(i) = self.directories.binary_search_by(|d| d.name.as_str().cmp(name)) {
            return Some(TreeEntry::Directory(&self.directories[i]));
        }
        if let Ok(i) = self.symlinks.binary_search_by(|s| s.name.as_str().cmp(name)) {
            return Some(TreeEntry::Symlink(&self.symlinks[i]));
        }
        None
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        let names = self
            .files
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.directories.iter().map(|d| d.name.as_str()))
            .chain(self.symlinks.iter().map(|s| s.name.as_str()));
        for name in names {
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                return Err(BstError::cas(format!("invalid entry name {name:?} in directory object")));
            }
            if !seen.insert(name) {
                return Err(BstError::cas(format!("duplicate entry name {name:?} in directory object")));
            }
        }
        for pair in self.files.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(BstError::cas("unsorted file entries in directory object"));
            }
        }
        for pair in self.directories.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(BstError::cas("unsorted directory entries in directory object"));
            }
        }
        for pair in self.symlinks.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(BstError::cas("unsorted symlink entries in directory object"));
            }
        }
        Ok(())
    }
}

/// A borrowed view of one entry of a [`Tree`].
#[derive(Clone, Copy, Debug)]
pub enum TreeEntry<'a> {
    File(&'a FileNode),
    Directory(&'a DirectoryNode),
    Symlink(&'a SymlinkNode),
}
