//! Workspace jail: path resolution and file operations confined to one root.
//!
//! Every client-supplied path is interpreted relative to the workspace root
//! (a leading `/` means the root itself) and resolved component by component,
//! following symlinks the way the kernel would. Only the fully resolved path is
//! checked for containment, so a link that leaves the root and comes back is
//! accepted while any link or `..` that ends outside it is rejected.
//!
//! The jail is synchronous; async callers run it on the blocking pool.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Upper bound on symlinks followed during one resolution.
const MAX_SYMLINK_HOPS: usize = 40;

/// Type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A single directory listing entry. Recomputed on every listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time in seconds since the Unix epoch.
    pub modified: Option<u64>,
}

impl FileEntry {
    fn from_metadata(name: String, meta: &fs::Metadata) -> Self {
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        Self {
            name,
            kind,
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified,
        }
    }
}

enum Step {
    Up,
    Down(OsString),
}

fn steps(path: &Path) -> Vec<Step> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(Step::Down(name.to_os_string())),
            Component::ParentDir => Some(Step::Up),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
        })
        .collect()
}

/// Filesystem access scoped to a single, immutable root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceJail {
    root: PathBuf,
}

impl WorkspaceJail {
    /// Opens (creating if needed) the workspace root and canonicalizes it.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .map_err(|e| GatewayError::system(format!("creating {}", root.display()), e))?;
        let root = fs::canonicalize(root)
            .map_err(|e| GatewayError::system(format!("canonicalizing {}", root.display()), e))?;
        if !root.is_dir() {
            return Err(GatewayError::NotADirectory(root.display().to_string()));
        }
        debug!(root = %root.display(), "Workspace jail opened");
        Ok(Self { root })
    }

    /// The canonical workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `relative` to an absolute path inside the root.
    ///
    /// The path does not have to exist; missing trailing components are
    /// appended lexically after the existing prefix has been resolved.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        self.resolve_path(Path::new(relative), relative)
    }

    fn resolve_path(&self, path: &Path, shown: &str) -> Result<PathBuf> {
        let resolved = self.walk(path)?;
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(GatewayError::PathEscape(shown.to_string()))
        }
    }

    fn walk(&self, relative: &Path) -> Result<PathBuf> {
        let mut pending: VecDeque<Step> = steps(relative).into();
        let mut current = self.root.clone();
        let mut hops = 0usize;

        while let Some(step) = pending.pop_front() {
            let name = match step {
                Step::Up => {
                    current.pop();
                    continue;
                }
                Step::Down(name) => name,
            };
            let candidate = current.join(&name);
            match fs::symlink_metadata(&candidate) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(GatewayError::system(
                            format!("resolving {}", relative.display()),
                            io::Error::from_raw_os_error(libc::ELOOP),
                        ));
                    }
                    let target = fs::read_link(&candidate).map_err(|e| {
                        GatewayError::system(format!("reading link {}", candidate.display()), e)
                    })?;
                    if target.is_absolute() {
                        current = PathBuf::from("/");
                    }
                    for step in steps(&target).into_iter().rev() {
                        pending.push_front(step);
                    }
                }
                // Existing entries and missing ones both extend the path; for
                // missing entries the remainder is purely lexical.
                _ => current = candidate,
            }
        }
        Ok(current)
    }

    /// Like [`resolve`](Self::resolve) but does not follow a symlink in the
    /// final component, so operations act on the link itself.
    fn resolve_entry(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => {
                let parent = self.resolve_path(parent, relative)?;
                Ok(parent.join(name))
            }
            _ => self.resolve(relative),
        }
    }

    fn io_error(relative: &str, action: &str, err: io::Error) -> GatewayError {
        if err.kind() == io::ErrorKind::NotFound {
            return GatewayError::NotFound(relative.to_string());
        }
        match err.raw_os_error() {
            Some(libc::ENOTDIR) => GatewayError::NotADirectory(relative.to_string()),
            Some(libc::EISDIR) => GatewayError::IsADirectory(relative.to_string()),
            _ => GatewayError::system(format!("{action} {relative}"), err),
        }
    }

    /// Creates the missing directories above `path`. A file in the way is
    /// `NotADirectory`.
    fn create_parent(path: &Path, relative: &str) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        fs::create_dir_all(parent).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => GatewayError::NotADirectory(relative.to_string()),
            _ => Self::io_error(relative, "creating parent of", e),
        })
    }

    /// Lists a directory, directories first then case-insensitive by name.
    pub fn list(&self, relative: &str) -> Result<Vec<FileEntry>> {
        let dir = self.resolve(relative)?;
        let meta = fs::metadata(&dir).map_err(|e| Self::io_error(relative, "listing", e))?;
        if !meta.is_dir() {
            return Err(GatewayError::NotADirectory(relative.to_string()));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Self::io_error(relative, "listing", e))? {
            let entry = entry.map_err(|e| Self::io_error(relative, "listing", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Broken links still show up, described by the link itself.
            let meta = match fs::metadata(entry.path()).or_else(|_| entry.metadata()) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(entry = %name, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            entries.push(FileEntry::from_metadata(name, &meta));
        }
        entries.sort_by(|a, b| {
            (a.kind != EntryKind::Directory, a.name.to_lowercase())
                .cmp(&(b.kind != EntryKind::Directory, b.name.to_lowercase()))
        });
        Ok(entries)
    }

    /// Reads a whole file.
    pub fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        let meta = fs::metadata(&path).map_err(|e| Self::io_error(relative, "reading", e))?;
        if meta.is_dir() {
            return Err(GatewayError::IsADirectory(relative.to_string()));
        }
        fs::read(&path).map_err(|e| Self::io_error(relative, "reading", e))
    }

    /// Writes a whole file, creating missing parent directories.
    pub fn write(&self, relative: &str, content: &[u8]) -> Result<()> {
        let path = self.resolve(relative)?;
        if path == self.root {
            return Err(GatewayError::RootProtected);
        }
        if path.is_dir() {
            return Err(GatewayError::IsADirectory(relative.to_string()));
        }
        Self::create_parent(&path, relative)?;
        fs::write(&path, content).map_err(|e| Self::io_error(relative, "writing", e))?;
        debug!(path = %path.display(), bytes = content.len(), "File written");
        Ok(())
    }

    /// Deletes a file, link or directory tree. Never the root.
    pub fn delete(&self, relative: &str) -> Result<()> {
        let path = self.resolve_entry(relative)?;
        if path == self.root {
            return Err(GatewayError::RootProtected);
        }
        let meta =
            fs::symlink_metadata(&path).map_err(|e| Self::io_error(relative, "deleting", e))?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .map_err(|e| Self::io_error(relative, "deleting", e))?;
        debug!(path = %path.display(), "Entry deleted");
        Ok(())
    }

    /// Creates a directory and its parents. Existing directories are fine.
    pub fn create_dir(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        if path.exists() && !path.is_dir() {
            return Err(GatewayError::NotADirectory(relative.to_string()));
        }
        fs::create_dir_all(&path).map_err(|e| Self::io_error(relative, "creating", e))
    }

    /// Moves an entry within the jail, replacing a file at the destination.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve_entry(from)?;
        let dst = self.resolve_entry(to)?;
        if src == self.root || dst == self.root {
            return Err(GatewayError::RootProtected);
        }
        fs::symlink_metadata(&src).map_err(|e| Self::io_error(from, "renaming", e))?;
        Self::create_parent(&dst, to)?;
        fs::rename(&src, &dst).map_err(|e| Self::io_error(from, "renaming", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn jail() -> (TempDir, WorkspaceJail) {
        let temp = TempDir::new().expect("failed to create temp dir");
        let jail = WorkspaceJail::open(temp.path().join("ws")).expect("failed to open jail");
        (temp, jail)
    }

    #[test]
    fn test_resolve_plain_paths() {
        let (_temp, jail) = jail();
        assert_eq!(jail.resolve("").unwrap(), jail.root());
        assert_eq!(jail.resolve("/").unwrap(), jail.root());
        assert_eq!(jail.resolve("a/b.txt").unwrap(), jail.root().join("a/b.txt"));
        assert_eq!(jail.resolve("a/./../c").unwrap(), jail.root().join("c"));
    }

    #[test]
    fn test_resolve_rejects_parent_escape() {
        let (_temp, jail) = jail();
        for path in ["..", "../ws2", "a/../../x", "/../etc/passwd"] {
            let err = jail.resolve(path).unwrap_err();
            assert_eq!(err.code(), "PathEscape", "{path} should escape");
        }
    }

    #[test]
    fn test_resolve_rejects_sibling_with_common_prefix() {
        let (temp, jail) = jail();
        fs::create_dir(temp.path().join("ws-other")).unwrap();
        symlink(temp.path().join("ws-other"), jail.root().join("sneaky")).unwrap();
        assert_eq!(jail.resolve("sneaky/x").unwrap_err().code(), "PathEscape");
    }

    #[test]
    fn test_resolve_follows_symlinks_inside_root() {
        let (_temp, jail) = jail();
        fs::create_dir(jail.root().join("real")).unwrap();
        symlink("real", jail.root().join("alias")).unwrap();
        assert_eq!(
            jail.resolve("alias/file").unwrap(),
            jail.root().join("real/file")
        );
    }

    #[test]
    fn test_symlink_escape_blocks_every_operation() {
        let (temp, jail) = jail();
        let outside = temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("secret"), b"s3cret").unwrap();
        symlink(&outside, jail.root().join("out")).unwrap();

        assert_eq!(jail.list("out").unwrap_err().code(), "PathEscape");
        assert_eq!(jail.read("out/secret").unwrap_err().code(), "PathEscape");
        assert_eq!(
            jail.write("out/new", b"x").unwrap_err().code(),
            "PathEscape"
        );
        assert_eq!(jail.delete("out/secret").unwrap_err().code(), "PathEscape");
        assert_eq!(jail.create_dir("out/d").unwrap_err().code(), "PathEscape");

        assert!(!outside.join("new").exists());
        assert!(!outside.join("d").exists());
        assert!(outside.join("secret").exists());
    }

    #[test]
    fn test_dangling_symlink_out_of_root_is_rejected() {
        let (temp, jail) = jail();
        symlink(temp.path().join("nowhere"), jail.root().join("dangling")).unwrap();
        assert_eq!(
            jail.write("dangling", b"x").unwrap_err().code(),
            "PathEscape"
        );
        assert!(!temp.path().join("nowhere").exists());
    }

    #[test]
    fn test_write_read_roundtrip_including_empty() {
        let (_temp, jail) = jail();
        jail.write("notes.txt", b"hi").unwrap();
        assert_eq!(jail.read("notes.txt").unwrap(), b"hi");
        jail.write("deep/nested/empty.bin", b"").unwrap();
        assert_eq!(jail.read("deep/nested/empty.bin").unwrap(), b"");
    }

    #[test]
    fn test_delete_then_read_is_not_found() {
        let (_temp, jail) = jail();
        jail.write("gone.txt", b"bye").unwrap();
        jail.delete("gone.txt").unwrap();
        assert_eq!(jail.read("gone.txt").unwrap_err().code(), "NotFound");
        assert_eq!(jail.delete("gone.txt").unwrap_err().code(), "NotFound");
    }

    #[test]
    fn test_delete_refuses_root() {
        let (_temp, jail) = jail();
        for path in ["", "/", ".", "a/.."] {
            assert_eq!(jail.delete(path).unwrap_err().code(), "RootProtected");
        }
        assert!(jail.root().exists());
    }

    #[test]
    fn test_delete_symlink_removes_link_only() {
        let (_temp, jail) = jail();
        jail.write("target.txt", b"keep").unwrap();
        symlink("target.txt", jail.root().join("link")).unwrap();
        jail.delete("link").unwrap();
        assert_eq!(jail.read("target.txt").unwrap(), b"keep");
    }

    #[test]
    fn test_list_sorts_directories_first() {
        let (_temp, jail) = jail();
        jail.write("b.txt", b"12345").unwrap();
        jail.write("A.txt", b"").unwrap();
        jail.create_dir("zdir").unwrap();

        let entries = jail.list("").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["zdir", "A.txt", "b.txt"]);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[2].size, 5);
        assert!(entries[2].modified.is_some());
    }

    #[test]
    fn test_list_errors() {
        let (_temp, jail) = jail();
        jail.write("file.txt", b"x").unwrap();
        assert_eq!(jail.list("missing").unwrap_err().code(), "NotFound");
        assert_eq!(jail.list("file.txt").unwrap_err().code(), "NotADirectory");
    }

    #[test]
    fn test_file_used_as_directory() {
        let (_temp, jail) = jail();
        jail.write("f.txt", b"x").unwrap();
        for result in [
            jail.write("f.txt/child", b"y"),
            jail.write("f.txt/a/b", b"y"),
            jail.read("f.txt/child").map(drop),
            jail.list("f.txt/child").map(drop),
            jail.create_dir("f.txt/child"),
            jail.delete("f.txt/child"),
            jail.rename("f.txt", "f.txt/child"),
        ] {
            assert_eq!(result.unwrap_err().code(), "NotADirectory");
        }
        assert_eq!(jail.read("f.txt").unwrap(), b"x");
    }

    #[test]
    fn test_read_directory_is_rejected() {
        let (_temp, jail) = jail();
        jail.create_dir("d").unwrap();
        assert_eq!(jail.read("d").unwrap_err().code(), "IsADirectory");
        assert_eq!(jail.write("d", b"x").unwrap_err().code(), "IsADirectory");
    }

    #[test]
    fn test_rename_moves_within_jail() {
        let (_temp, jail) = jail();
        jail.write("old.txt", b"data").unwrap();
        jail.rename("old.txt", "sub/new.txt").unwrap();
        assert_eq!(jail.read("sub/new.txt").unwrap(), b"data");
        assert_eq!(jail.read("old.txt").unwrap_err().code(), "NotFound");
        assert_eq!(
            jail.rename("sub/new.txt", "../escaped.txt").unwrap_err().code(),
            "PathEscape"
        );
        assert_eq!(jail.rename("", "x").unwrap_err().code(), "RootProtected");
        assert_eq!(jail.rename("missing", "x").unwrap_err().code(), "NotFound");
    }
}
