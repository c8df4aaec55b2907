use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::context::StorageContext;
use crate::document::{
    build_document_uri_using_tree, document_id, is_content_uri, tree_document_id, ChildQuery,
    DocumentStream, DEFAULT_MIME,
};
use crate::error::{CoreError, CoreResult};
use crate::file_stream::FileStream;
use crate::stream::StorageStream;

#[derive(Debug, Clone)]
enum Binding {
    Direct { path: PathBuf },
    Document { uri: Url, id: String },
}

/// A file inside a directory, bound either to a direct path or to a provider document.
///
/// An unbound handle is an invalid placeholder: it remembers name, type and parent so it
/// can be compared and re-created, but refuses I/O until it is resolved again.
#[derive(Clone)]
pub struct StorageLocation {
    ctx: StorageContext,
    binding: Option<Binding>,
    parent: Option<Url>,
    name: Option<String>,
    mime_type: String,
    tag: Option<String>,
}

/// Serializable form of a [`StorageLocation`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationRecord {
    pub source: Option<String>,
    pub parent: Option<String>,
    pub name: Option<String>,
    pub mime_type: String,
    pub tag: Option<String>,
}

impl StorageLocation {
    pub fn placeholder(
        ctx: StorageContext,
        parent: Option<Url>,
        name: impl Into<String>,
        mime_type: Option<&str>,
        tag: Option<String>,
    ) -> Self {
        Self {
            ctx,
            binding: None,
            parent,
            name: Some(name.into()),
            mime_type: mime_type.unwrap_or(DEFAULT_MIME).to_string(),
            tag,
        }
    }

    /// Resolves an existing file or document URI.
    ///
    /// A document whose name no longer resolves yields an invalid placeholder rather than
    /// an error; check [`StorageLocation::is_invalid`].
    pub fn from_uri(
        ctx: StorageContext,
        parent: Option<Url>,
        uri: &Url,
        mime_type: Option<&str>,
        tag: Option<String>,
    ) -> CoreResult<Self> {
        let mut location = Self {
            ctx,
            binding: None,
            parent,
            name: None,
            mime_type: mime_type.unwrap_or(DEFAULT_MIME).to_string(),
            tag,
        };

        if is_content_uri(uri) {
            let provider = location.ctx.provider(uri)?;
            let id = document_id(uri)
                .ok_or_else(|| CoreError::NotFound(format!("no document id in {}", uri)))?;
            let Some(entry) = provider.stat(&id) else {
                debug!(%uri, "document does not resolve to a name");
                return Ok(location);
            };
            location.ctx.take_permission(uri)?;
            location.name = Some(entry.display_name);
            if let Some(mime) = entry.mime_type {
                location.mime_type = mime;
            }
            location.binding = Some(Binding::Document {
                uri: uri.clone(),
                id,
            });
        } else {
            let path = uri
                .to_file_path()
                .map_err(|_| CoreError::Unsupported(format!("not a file uri: {}", uri)))?;
            location.name = path.file_name().map(|name| name.to_string_lossy().to_string());
            location.binding = Some(Binding::Direct { path });
        }
        Ok(location)
    }

    /// Creates `name` inside a direct directory, reusing a file that is already there.
    pub(crate) fn create_direct(
        ctx: StorageContext,
        dir: &Path,
        name: &str,
        mime_type: Option<&str>,
        tag: Option<String>,
    ) -> CoreResult<Self> {
        let path = dir.join(name);
        ensure_file(&path)?;
        let parent = Url::from_directory_path(dir).ok();
        Ok(Self {
            ctx,
            binding: Some(Binding::Direct { path }),
            parent,
            name: Some(name.to_string()),
            mime_type: mime_type.unwrap_or(DEFAULT_MIME).to_string(),
            tag,
        })
    }

    /// Creates `name` inside a provider tree.
    ///
    /// With `safe` the caller already knows the name is free. Otherwise an existing file is
    /// reused and an existing directory is deleted first.
    pub(crate) fn create_document(
        ctx: StorageContext,
        tree: &Url,
        tree_id: &str,
        name: &str,
        mime_type: Option<&str>,
        safe: bool,
        tag: Option<String>,
    ) -> CoreResult<Self> {
        let mime_type = mime_type.unwrap_or(DEFAULT_MIME).to_string();
        let id = if safe {
            ctx.provider(tree)?
                .create_document(tree_id, &mime_type, name)?
        } else {
            create_or_reuse_document(&ctx, tree, tree_id, name, &mime_type)?
        };
        let uri = build_document_uri_using_tree(tree, &id)?;
        let entry = ctx.provider(tree)?.stat(&id);
        Ok(Self {
            ctx,
            binding: Some(Binding::Document { uri, id }),
            parent: Some(tree.clone()),
            name: Some(
                entry
                    .as_ref()
                    .map(|entry| entry.display_name.clone())
                    .unwrap_or_else(|| name.to_string()),
            ),
            mime_type: entry.and_then(|entry| entry.mime_type).unwrap_or(mime_type),
            tag,
        })
    }

    pub fn from_record(ctx: StorageContext, record: &LocationRecord) -> CoreResult<Self> {
        let parent = match &record.parent {
            Some(parent) => Some(
                Url::parse(parent).map_err(|err| CoreError::InvalidState(err.to_string()))?,
            ),
            None => None,
        };
        let Some(source) = &record.source else {
            let mut location = Self::placeholder(
                ctx,
                parent,
                record.name.clone().unwrap_or_default(),
                Some(&record.mime_type),
                record.tag.clone(),
            );
            location.name = record.name.clone();
            return Ok(location);
        };
        let uri = Url::parse(source).map_err(|err| CoreError::InvalidState(err.to_string()))?;
        let mut location =
            Self::from_uri(ctx, parent, &uri, Some(&record.mime_type), record.tag.clone())?;
        if location.name.is_none() {
            location.name = record.name.clone();
        }
        Ok(location)
    }

    pub fn to_record(&self) -> LocationRecord {
        LocationRecord {
            source: self.uri().ok().map(|uri| uri.to_string()),
            parent: self.parent.as_ref().map(|uri| uri.to_string()),
            name: self.name(),
            mime_type: self.mime_type(),
            tag: self.tag.clone(),
        }
    }

    /// Opens the backing storage for random access.
    pub fn stream(&self) -> CoreResult<Box<dyn StorageStream>> {
        match self.binding()? {
            Binding::Direct { path } => Ok(Box::new(FileStream::open(path)?)),
            Binding::Document { uri, id } => {
                let descriptor = self.ctx.provider(uri)?.open_descriptor(id)?;
                Ok(Box::new(DocumentStream::acquire(descriptor, uri.clone())?))
            }
        }
    }

    pub fn is_direct(&self) -> CoreResult<bool> {
        Ok(matches!(self.binding()?, Binding::Direct { .. }))
    }

    pub fn is_invalid(&self) -> bool {
        self.binding.is_none()
    }

    pub fn uri(&self) -> CoreResult<Url> {
        match self.binding()? {
            Binding::Direct { path } => Url::from_file_path(path)
                .map_err(|_| CoreError::InvalidState(format!("relative path {}", path.display()))),
            Binding::Document { uri, .. } => Ok(uri.clone()),
        }
    }

    pub fn parent_uri(&self) -> CoreResult<Option<Url>> {
        self.binding()?;
        Ok(self.parent.clone())
    }

    pub fn truncate(&self) -> CoreResult<()> {
        let mut stream = self.stream()?;
        let result = stream.set_length(0);
        stream.close();
        result
    }

    /// Removes the backing file. An invalid handle has nothing to delete and reports success.
    pub fn delete(&self) -> bool {
        match &self.binding {
            None => true,
            Some(Binding::Direct { path }) => match fs::remove_file(path) {
                Ok(()) => true,
                Err(err) if err.kind() == ErrorKind::NotFound => false,
                Err(err) => {
                    warn!(path = %path.display(), "failed to delete: {err}");
                    false
                }
            },
            Some(Binding::Document { uri, id }) => {
                let deleted = match self.ctx.provider(uri) {
                    Ok(provider) => provider.delete_document(id).unwrap_or_else(|err| {
                        warn!(%uri, "failed to delete: {err}");
                        false
                    }),
                    Err(err) => {
                        warn!(%uri, "failed to delete: {err}");
                        false
                    }
                };
                self.ctx.release_permission(uri);
                deleted
            }
        }
    }

    pub fn length(&self) -> CoreResult<u64> {
        match self.binding()? {
            Binding::Direct { path } => match fs::metadata(path) {
                Ok(meta) => Ok(meta.len()),
                Err(err) => {
                    warn!(path = %path.display(), "failed to read size: {err}");
                    Ok(0)
                }
            },
            Binding::Document { uri, id } => Ok(self
                .ctx
                .provider(uri)?
                .stat(id)
                .map(|entry| entry.size)
                .unwrap_or(0)),
        }
    }

    pub fn can_write(&self) -> bool {
        match &self.binding {
            None => false,
            Some(Binding::Direct { path }) => fs::metadata(path)
                .map(|meta| !meta.permissions().readonly())
                .unwrap_or(false),
            Some(Binding::Document { uri, id }) => self
                .ctx
                .provider(uri)
                .ok()
                .and_then(|provider| provider.stat(id))
                .map(|entry| entry.writable)
                .unwrap_or(false),
        }
    }

    pub fn name(&self) -> Option<String> {
        match &self.binding {
            None => self.name.clone(),
            Some(Binding::Direct { path }) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            Some(Binding::Document { uri, id }) => self
                .ctx
                .provider(uri)
                .ok()
                .and_then(|provider| provider.display_name(id))
                .or_else(|| self.name.clone()),
        }
    }

    pub fn mime_type(&self) -> String {
        if let Some(Binding::Document { uri, id }) = &self.binding {
            let mime = self
                .ctx
                .provider(uri)
                .ok()
                .and_then(|provider| provider.stat(id))
                .and_then(|entry| entry.mime_type);
            if let Some(mime) = mime {
                return mime;
            }
        }
        self.mime_type.clone()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn set_tag(&mut self, tag: Option<String>) {
        self.tag = tag;
    }

    pub fn exists_as_file(&self) -> bool {
        match &self.binding {
            None => {
                debug!(name = ?self.name, "exists_as_file on an invalid location");
                false
            }
            Some(Binding::Direct { path }) => path.is_file(),
            Some(Binding::Document { uri, id }) => self
                .ctx
                .provider(uri)
                .ok()
                .and_then(|provider| provider.stat(id))
                .map(|entry| !entry.is_directory)
                .unwrap_or(false),
        }
    }

    /// Creates the backing file. An invalid handle is resolved again from its parent,
    /// name and type.
    pub fn create(&mut self) -> CoreResult<()> {
        match self.binding.clone() {
            Some(Binding::Direct { path }) => {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
            }
            Some(Binding::Document { uri, .. }) => {
                let tree = self.parent.clone().ok_or_else(|| {
                    CoreError::InvalidTree(format!("{} has no parent tree", uri))
                })?;
                self.recreate_in(&tree)?;
            }
            None => {
                let tree = self.parent.clone().ok_or_else(|| {
                    CoreError::InvalidState("invalid location without a parent".to_string())
                })?;
                self.recreate_in(&tree)?;
            }
        }
        self.name = self.name();
        self.mime_type = self.mime_type();
        Ok(())
    }

    fn recreate_in(&mut self, tree: &Url) -> CoreResult<()> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| CoreError::InvalidState("location has no name".to_string()))?;
        let created = if is_content_uri(tree) {
            let tree_id = self
                .ctx
                .provider(tree)?
                .tree_root(tree)
                .or_else(|| tree_document_id(tree))
                .ok_or_else(|| CoreError::InvalidTree(tree.to_string()))?;
            Self::create_document(
                self.ctx.clone(),
                tree,
                &tree_id,
                &name,
                Some(&self.mime_type),
                false,
                self.tag.clone(),
            )?
        } else {
            let dir = tree
                .to_file_path()
                .map_err(|_| CoreError::InvalidTree(tree.to_string()))?;
            let path = dir.join(&name);
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
            Self {
                ctx: self.ctx.clone(),
                binding: Some(Binding::Direct { path }),
                parent: Some(tree.clone()),
                name: Some(name),
                mime_type: self.mime_type.clone(),
                tag: self.tag.clone(),
            }
        };
        self.binding = created.binding;
        Ok(())
    }

    /// Drops the live binding, keeping only name, type, parent and tag.
    pub fn invalidate(&mut self) {
        if self.binding.is_none() {
            return;
        }
        self.name = self.name();
        self.mime_type = self.mime_type();
        self.binding = None;
    }

    fn binding(&self) -> CoreResult<&Binding> {
        self.binding
            .as_ref()
            .ok_or_else(|| CoreError::InvalidState("storage location is invalid".to_string()))
    }
}

impl PartialEq for StorageLocation {
    fn eq(&self, other: &Self) -> bool {
        let parent = |location: &StorageLocation| {
            location
                .parent
                .as_ref()
                .map(|uri| uri.as_str().to_lowercase())
        };
        if parent(self) != parent(other) {
            return false;
        }
        match (&self.binding, &other.binding) {
            (None, None) => match (&self.name, &other.name) {
                (Some(a), Some(b)) => {
                    a.to_lowercase() == b.to_lowercase()
                        && self.mime_type.to_lowercase() == other.mime_type.to_lowercase()
                }
                _ => false,
            },
            (Some(Binding::Direct { path: a }), Some(Binding::Direct { path: b })) => a == b,
            (Some(Binding::Document { id: a, .. }), Some(Binding::Document { id: b, .. })) => {
                a.to_lowercase() == b.to_lowercase()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.binding {
            None => write!(
                f,
                "[invalid] name={:?} type={} tag={:?}",
                self.name, self.mime_type, self.tag
            ),
            Some(Binding::Direct { path }) => {
                write!(f, "path={} tag={:?}", path.display(), self.tag)
            }
            Some(Binding::Document { uri, .. }) => write!(
                f,
                "document={} tree={} tag={:?}",
                uri,
                self.parent.as_ref().map(|p| p.as_str()).unwrap_or(""),
                self.tag
            ),
        }
    }
}

fn ensure_file(path: &Path) -> CoreResult<()> {
    if path.is_file() {
        return Ok(());
    }
    if path.is_dir() {
        fs::remove_dir(path).map_err(|err| {
            CoreError::DirectoryCollision(format!("{}: {}", path.display(), err))
        })?;
        warn!(path = %path.display(), "removed empty directory in the way of a new file");
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
    Ok(())
}

fn create_or_reuse_document(
    ctx: &StorageContext,
    tree: &Url,
    tree_id: &str,
    name: &str,
    mime_type: &str,
) -> CoreResult<String> {
    let provider = ctx.provider(tree)?;
    let existing = provider
        .query_children(tree_id, &ChildQuery::Exact(name.to_string()))?
        .into_iter()
        .next();
    match existing {
        Some(entry) if entry.is_directory => {
            let deleted = provider.delete_document(&entry.id).map_err(|err| {
                CoreError::DirectoryCollision(format!("{}: {}", entry.id, err))
            })?;
            if !deleted {
                return Err(CoreError::DirectoryCollision(format!(
                    "directory with the same name found but cannot delete: {}",
                    entry.id
                )));
            }
            warn!(document = %entry.id, "deleted directory in the way of a new file");
            provider.create_document(tree_id, mime_type, name)
        }
        Some(entry) => Ok(entry.id),
        None => provider.create_document(tree_id, mime_type, name),
    }
}
