//! Local-directory workspace filesystem.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lspmux_protocol::{FileInfo, ServerId};
use lspmux_proxy::{FsProvider, WorkspaceFs, WorkspaceFsDyn};
use tracing::debug;

/// A read-only view over one directory tree. Workspace-relative paths are
/// resolved against the root; traversal outside the root is rejected.
pub struct LocalWorkspaceFs {
    root: PathBuf,
    closed: AtomicBool,
}

impl LocalWorkspaceFs {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            closed: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path. Rejects escapes via `..`.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::other("workspace filesystem closed"));
        }
        let resolved = normalize_path(&self.root.join(path.trim_start_matches('/')));
        if !resolved.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("path escapes workspace: {path}"),
            ));
        }
        Ok(resolved)
    }
}

fn file_info(name: String, meta: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name,
        size: if meta.is_dir() { 0 } else { meta.len() },
        dir: meta.is_dir(),
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl WorkspaceFs for LocalWorkspaceFs {
    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let resolved = self.resolve(path)?;
        tokio::fs::read(&resolved).await
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<FileInfo>> {
        let resolved = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&resolved).await?;
        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            infos.push(file_info(
                entry.file_name().to_string_lossy().to_string(),
                &meta,
            ));
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn stat(&self, path: &str) -> io::Result<FileInfo> {
        let resolved = self.resolve(path)?;
        let meta = tokio::fs::metadata(&resolved).await?;
        Ok(file_info(base_name(&resolved), &meta))
    }

    async fn lstat(&self, path: &str) -> io::Result<FileInfo> {
        let resolved = self.resolve(path)?;
        let meta = tokio::fs::symlink_metadata(&resolved).await?;
        Ok(file_info(base_name(&resolved), &meta))
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`LocalWorkspaceFs`] views under a base directory: one
/// subdirectory per workspace context, further scoped by the identity's
/// path prefix.
pub struct LocalFsProvider {
    base: PathBuf,
}

impl LocalFsProvider {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// The on-disk root for an identity:
    /// `<base>/<sanitized root_uri>/<path_prefix>`.
    pub fn root_for(&self, id: &ServerId) -> PathBuf {
        let mut root = self.base.join(sanitize(&id.context.root_uri));
        let prefix = id.path_prefix.trim_matches('/');
        if !prefix.is_empty() {
            root = root.join(prefix);
        }
        root
    }
}

impl FsProvider for LocalFsProvider {
    async fn open(&self, id: &ServerId) -> io::Result<Arc<dyn WorkspaceFsDyn>> {
        let root = self.root_for(id);
        let meta = tokio::fs::metadata(&root).await?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("workspace root is not a directory: {}", root.display()),
            ));
        }
        debug!("opened workspace filesystem at {} for {id}", root.display());
        Ok(Arc::new(LocalWorkspaceFs::new(root)))
    }
}

/// Flatten a workspace URI into a single path segment.
fn sanitize(uri: &str) -> String {
    uri.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}
