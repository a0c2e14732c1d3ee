//! Utility functions

use crate::error::{BstError, Result};
use serde::de::DeserializeOwned;
use sha2::{Digest as _, Sha256};
use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// The buffer size used when streaming files through the hasher.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Hashes an in-memory buffer with SHA-256, returning the lowercase hex
/// digest.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Streams the file at `path` through SHA-256.
///
/// Returns the lowercase hex digest and the byte count.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = fs::File::open(path).map_err(|err| BstError::io(err, path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|err| BstError::io(err, path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Reads the YAML file at `path` into a value of type `T`.
pub fn read_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = fs::File::open(path).map_err(|err| BstError::io(err, path))?;
    let value = serde_yaml::from_reader(io::BufReader::new(file))?;
    Ok(value)
}

/// Writes `content` to `path` atomically.
///
/// The content lands in a temporary file on the same filesystem first and is
/// renamed into place, so concurrent readers observe either the previous
/// content or the new content, never a torn file.
pub fn save_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| BstError::cas(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|err| BstError::io(err, dir))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| BstError::io(err, dir))?;
    tmp.write_all(content).map_err(|err| BstError::io(err, path))?;
    tmp.flush().map_err(|err| BstError::io(err, path))?;
    tmp.persist(path).map_err(|err| BstError::io(err.error, path))?;
    Ok(())
}

/// Creates all parent directories of the given file path.
pub fn create_parent_dir_all(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| BstError::io(err, parent))?;
    }
    Ok(())
}

/// Canonicalize the path, resolving symlinks.
///
/// On windows this will ensure the path only consists of `/` separators and
/// is not an UNC path.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| BstError::io(err, path))
}

/// Returns the total apparent size in bytes of all regular files below
/// `path`, following no symlinks.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|err| BstError::cas(format!("failed to walk {}: {err}", path.display())))?;
        if entry.file_type().is_file() {
            let meta = entry
                .metadata()
                .map_err(|err| BstError::cas(format!("failed to stat {}: {err}", entry.path().display())))?;
            total += meta.len();
        }
    }
    Ok(total)
}

/// Creates a hardlink from `src` to `dest`, falling back to a copy when the
/// link fails because the two paths live on different filesystems.
pub fn hardlink_or_copy(src: &Path, dest: &Path) -> Result<()> {
    match fs::hard_link(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            fs::remove_file(dest).map_err(|err| BstError::io(err, dest))?;
            fs::hard_link(src, dest).map_err(|err| BstError::io(err, dest))?;
            Ok(())
        }
        Err(_) => {
            fs::copy(src, dest).map_err(|err| BstError::io(err, dest))?;
            Ok(())
        }
    }
}

/// Recursively removes a directory tree, fixing up write permissions where
/// removal would otherwise fail on read-only directories.
pub fn force_rmtree(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|err| BstError::cas(format!("failed to walk {}: {err}", path.display())))?;
        if entry.file_type().is_dir() {
            let meta = entry.metadata().map_err(|err| BstError::cas(err.to_string()))?;
            let mut perms = meta.permissions();
            if perms.readonly() {
                cfg_if::cfg_if! {
                    if #[cfg(unix)] {
                        use std::os::unix::fs::PermissionsExt;
                        perms.set_mode(perms.mode() | 0o700);
                    } else {
                        #[allow(clippy::permissions_set_readonly_false)]
                        perms.set_readonly(false);
                    }
                }
                let _ = fs::set_permissions(entry.path(), perms);
            }
        }
    }
    fs::remove_dir_all(path).map_err(|err| BstError::io(err, path))
}

/// Translates a glob style pattern into an anchored regex string.
///
/// This supports path-like globbing:
///
/// * `*` matches any sequence of characters excepting path separators
/// * `**` matches any sequence of characters, including path separators
/// * `?` matches any single character except a path separator
/// * `[abc]` / `[a-z]` match one of the listed characters
/// * `[!abc]` / `[!a-z]` match any single character but the listed ones
pub fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut res = String::from("^");
    let n = chars.len();
    let mut i = 0;
    while i < n {
        let c = chars[i];
        i += 1;
        match c {
            '*' => {
                if i < n && chars[i] == '*' {
                    res.push_str(".*");
                    i += 1;
                } else {
                    res.push_str("[^/]*");
                }
            }
            '?' => res.push_str("[^/]"),
            '[' => {
                let mut j = i;
                if j < n && chars[j] == '!' {
                    j += 1;
                }
                if j < n && chars[j] == ']' {
                    j += 1;
                }
                while j < n && chars[j] != ']' {
                    j += 1;
                }
                if j >= n {
                    res.push_str("\\[");
                } else {
                    let stuff: String = chars[i..j].iter().collect::<String>().replace('\\', "\\\\");
                    i = j + 1;
                    res.push('[');
                    if let Some(rest) = stuff.strip_prefix('!') {
                        res.push('^');
                        res.push_str(rest);
                    } else if let Some(rest) = stuff.strip_prefix('^') {
                        res.push('\\');
                        res.push('^');
                        res.push_str(rest);
                    } else {
                        res.push_str(&stuff);
                    }
                    res.push(']');
                }
            }
            _ => res.push_str(&regex::escape(&c.to_string())),
        }
    }
    res.push('$');
    res
}

/// Yields the paths from `paths` which match the glob `pattern`.
///
/// Both the pattern and the candidate paths are normalized to a leading `/`
/// before matching, so patterns match the same set regardless of whether
/// either side carried a leading slash.
pub fn glob_filter<'a>(paths: impl IntoIterator<Item = &'a str>, pattern: &str) -> Result<Vec<String>> {
    let anchored =
        if pattern.starts_with('/') { pattern.to_string() } else { format!("/{pattern}") };
    let re = regex::Regex::new(&glob_to_regex(&anchored))
        .map_err(|err| BstError::load(format!("invalid glob pattern {pattern:?}: {err}")))?;
    let mut matched = Vec::new();
    for path in paths {
        let candidate = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
        if re.is_match(&candidate) {
            matched.push(path.to_string());
        }
    }
    Ok(matched)
}

/// Normalizes an element name for use in filesystem paths and refs,
/// replacing path separators with dashes and dropping the `.bst` suffix.
pub fn normal_name(element_name: &str) -> String {
    let trimmed = element_name.strip_suffix(".bst").unwrap_or(element_name);
    trimmed.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_file_matches_buffer_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("blob");
        fs::write(&file, b"hello world").unwrap();
        let (hash, size) = sha256_file(&file).unwrap();
        assert_eq!(hash, sha256_hex(b"hello world"));
        assert_eq!(size, 11);
    }

    #[test]
    fn atomic_save_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("refs/heads/some/ref");
        save_file_atomic(&file, b"one").unwrap();
        save_file_atomic(&file, b"two").unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"two");
    }

    #[test]
    fn glob_translation_single_star_stops_at_separator() {
        let re = regex::Regex::new(&glob_to_regex("/bin/*")).unwrap();
        assert!(re.is_match("/bin/tool"));
        assert!(!re.is_match("/bin/sub/tool"));
    }

    #[test]
    fn glob_translation_double_star_crosses_separators() {
        let re = regex::Regex::new(&glob_to_regex("/usr/**")).unwrap();
        assert!(re.is_match("/usr/share/doc/README"));
        assert!(!re.is_match("/etc/passwd"));
    }

    #[test]
    fn glob_translation_question_mark_and_classes() {
        let re = regex::Regex::new(&glob_to_regex("/lib?/[!a-c]*.so")).unwrap();
        assert!(re.is_match("/lib6/z.so"));
        assert!(!re.is_match("/lib6/a.so"));
        assert!(!re.is_match("/lib/z.so"));
    }

    #[test]
    fn glob_filter_ignores_leading_slash_differences() {
        let matched = glob_filter(["bin/tool", "etc/conf"], "/bin/*").unwrap();
        assert_eq!(matched, vec!["bin/tool".to_string()]);
    }

    #[test]
    fn normal_name_flattens_paths() {
        assert_eq!(normal_name("stack/base.bst"), "stack-base");
        assert_eq!(normal_name("app"), "app");
    }
}
