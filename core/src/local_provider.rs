use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;
use url::Url;

use crate::document::{
    build_tree_uri, document_id, tree_document_id, ChildQuery, Descriptor, DocumentEntry,
    DocumentProvider,
};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct LocalRoot {
    pub path: PathBuf,
    pub seekable: bool,
}

/// Provider that exposes local directories through document ids of the form
/// `<root>:<relative/path>`.
///
/// Access is limited to trees the user granted with [`LocalDocumentProvider::grant_tree`];
/// once a tree is revoked its documents stop resolving to a name.
pub struct LocalDocumentProvider {
    authority: String,
    roots: HashMap<String, LocalRoot>,
    granted: Mutex<HashSet<String>>,
}

impl LocalDocumentProvider {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            roots: HashMap::new(),
            granted: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_root(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.roots.insert(
            name.into(),
            LocalRoot {
                path: path.into(),
                seekable: true,
            },
        );
        self
    }

    /// Root whose documents only open as forward-only streams.
    pub fn with_stream_only_root(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.roots.insert(
            name.into(),
            LocalRoot {
                path: path.into(),
                seekable: false,
            },
        );
        self
    }

    pub fn tree_uri(&self, tree_id: &str) -> CoreResult<Url> {
        build_tree_uri(&self.authority, tree_id)
    }

    pub fn grant_tree(&self, tree_id: &str) {
        if let Ok(mut granted) = self.granted.lock() {
            granted.insert(tree_id.to_string());
        }
    }

    pub fn revoke_tree(&self, tree_id: &str) {
        if let Ok(mut granted) = self.granted.lock() {
            granted.remove(tree_id);
        }
    }

    fn covers(&self, document_id: &str) -> bool {
        let Ok(granted) = self.granted.lock() else {
            return false;
        };
        granted.iter().any(|tree| {
            document_id == tree
                || (tree.ends_with(':') && document_id.starts_with(tree.as_str()))
                || document_id
                    .strip_prefix(tree.as_str())
                    .map(|rest| rest.starts_with('/'))
                    .unwrap_or(false)
        })
    }

    fn split_id<'a>(&self, document_id: &'a str) -> CoreResult<(&LocalRoot, &'a str)> {
        let (root, relative) = document_id
            .split_once(':')
            .ok_or_else(|| CoreError::NotFound(document_id.to_string()))?;
        let root = self
            .roots
            .get(root)
            .ok_or_else(|| CoreError::NotFound(document_id.to_string()))?;
        Ok((root, relative.trim_matches('/')))
    }

    fn resolve_path(&self, document_id: &str) -> CoreResult<(PathBuf, bool)> {
        let (root, relative) = self.split_id(document_id)?;
        let relative = Path::new(relative);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if escapes {
            return Err(CoreError::Storage(format!(
                "document id escapes its root: {}",
                document_id
            )));
        }
        if relative.as_os_str().is_empty() {
            return Ok((root.path.clone(), root.seekable));
        }
        Ok((root.path.join(relative), root.seekable))
    }

    fn child_id(parent_id: &str, name: &str) -> String {
        if parent_id.ends_with(':') {
            format!("{}{}", parent_id, name)
        } else {
            format!("{}/{}", parent_id, name)
        }
    }

    fn entry_for(&self, document_id: &str, path: &Path) -> Option<DocumentEntry> {
        let meta = fs::metadata(path).ok()?;
        let display_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .or_else(|| {
                document_id
                    .split_once(':')
                    .map(|(root, _)| root.to_string())
            })?;
        Some(DocumentEntry {
            id: document_id.to_string(),
            display_name,
            mime_type: None,
            is_directory: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            writable: !meta.permissions().readonly(),
        })
    }
}

impl DocumentProvider for LocalDocumentProvider {
    fn authority(&self) -> &str {
        &self.authority
    }

    fn take_persistable_permission(&self, uri: &Url) -> CoreResult<()> {
        let id = document_id(uri)
            .or_else(|| tree_document_id(uri))
            .ok_or_else(|| CoreError::PermissionDenied(uri.to_string()))?;
        if self.covers(&id) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied(format!(
                "no grant covers {}",
                uri
            )))
        }
    }

    fn tree_root(&self, tree_uri: &Url) -> Option<String> {
        if tree_uri.host_str() != Some(self.authority.as_str()) {
            return None;
        }
        let id = tree_document_id(tree_uri)?;
        let (path, _) = self.resolve_path(&id).ok()?;
        if path.is_dir() {
            Some(id)
        } else {
            None
        }
    }

    fn stat(&self, document_id: &str) -> Option<DocumentEntry> {
        if !self.covers(document_id) {
            return None;
        }
        let (path, _) = self.resolve_path(document_id).ok()?;
        self.entry_for(document_id, &path)
    }

    fn parent_document(&self, document_id: &str) -> Option<String> {
        let (root, relative) = document_id.split_once(':')?;
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return None;
        }
        match relative.rsplit_once('/') {
            Some((parent, _)) => Some(format!("{}:{}", root, parent)),
            None => Some(format!("{}:", root)),
        }
    }

    fn query_children(&self, parent_id: &str, query: &ChildQuery) -> CoreResult<Vec<DocumentEntry>> {
        if !self.covers(parent_id) {
            return Err(CoreError::AccessRevoked(parent_id.to_string()));
        }
        let (path, _) = self.resolve_path(parent_id)?;
        let entries = fs::read_dir(&path).map_err(|err| CoreError::Io(err.to_string()))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CoreError::Io(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !query.matches(&name) {
                continue;
            }
            let id = Self::child_id(parent_id, &name);
            if let Some(doc) = self.entry_for(&id, &entry.path()) {
                out.push(doc);
            }
        }
        debug!(parent = parent_id, ?query, matches = out.len(), "queried children");
        Ok(out)
    }

    fn create_document(&self, parent_id: &str, _mime_type: &str, name: &str) -> CoreResult<String> {
        if !self.covers(parent_id) {
            return Err(CoreError::PermissionDenied(parent_id.to_string()));
        }
        validate_name(name)?;
        let id = Self::child_id(parent_id, name);
        let (path, _) = self.resolve_path(&id)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| CoreError::Storage(format!("cannot create {}: {}", id, err)))?;
        Ok(id)
    }

    fn create_directory(&self, parent_id: &str, name: &str) -> CoreResult<String> {
        if !self.covers(parent_id) {
            return Err(CoreError::PermissionDenied(parent_id.to_string()));
        }
        validate_name(name)?;
        let id = Self::child_id(parent_id, name);
        let (path, _) = self.resolve_path(&id)?;
        fs::create_dir(&path)
            .map_err(|err| CoreError::Storage(format!("cannot create {}: {}", id, err)))?;
        Ok(id)
    }

    fn delete_document(&self, document_id: &str) -> CoreResult<bool> {
        if !self.covers(document_id) {
            return Err(CoreError::PermissionDenied(document_id.to_string()));
        }
        let (path, _) = self.resolve_path(document_id)?;
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CoreError::Io(err.to_string())),
        }
    }

    fn open_descriptor(&self, document_id: &str) -> CoreResult<Descriptor> {
        if !self.covers(document_id) {
            return Err(CoreError::PermissionDenied(document_id.to_string()));
        }
        let (path, seekable) = self.resolve_path(document_id)?;
        if !seekable {
            let file = File::open(&path).map_err(|err| CoreError::Io(err.to_string()))?;
            return Ok(Descriptor::StreamOnly(Box::new(file)));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(Descriptor::ReadWrite(file))
    }
}

fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(CoreError::Storage(format!("invalid display name: {:?}", name)));
    }
    Ok(())
}
