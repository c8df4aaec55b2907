use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use url::Url;

use crate::context::StorageContext;
use crate::document::{build_document_uri_using_tree, is_content_uri, ChildQuery};
use crate::error::{CoreError, CoreResult};
use crate::location::StorageLocation;

#[derive(Debug, Clone)]
enum Root {
    Direct { path: PathBuf },
    Tree { uri: Url, id: String },
}

/// A directory new downloads are created in, either a plain path or a provider tree.
#[derive(Clone)]
pub struct StorageDirectory {
    ctx: StorageContext,
    root: Root,
    tag: Option<String>,
}

impl StorageDirectory {
    /// Resolves `uri`. Trees need a grant the provider agrees to persist and must resolve
    /// to a usable root document.
    pub fn open(ctx: StorageContext, uri: &Url, tag: Option<String>) -> CoreResult<Self> {
        if !is_content_uri(uri) {
            let path = uri
                .to_file_path()
                .map_err(|_| CoreError::Unsupported(format!("not a directory uri: {}", uri)))?;
            return Ok(Self {
                ctx,
                root: Root::Direct { path },
                tag,
            });
        }

        ctx.take_permission(uri)?;
        let id = ctx
            .provider(uri)?
            .tree_root(uri)
            .ok_or_else(|| CoreError::InvalidTree(format!("cannot use {} as a directory", uri)))?;
        debug!(%uri, tree = %id, "opened document tree");
        Ok(Self {
            ctx,
            root: Root::Tree {
                uri: uri.clone(),
                id,
            },
            tag,
        })
    }

    pub fn uri(&self) -> CoreResult<Url> {
        match &self.root {
            Root::Direct { path } => Url::from_directory_path(path)
                .map_err(|_| CoreError::InvalidState(format!("relative path {}", path.display()))),
            Root::Tree { uri, .. } => Ok(uri.clone()),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.root, Root::Direct { .. })
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn exists(&self) -> bool {
        match &self.root {
            Root::Direct { path } => path.is_dir(),
            Root::Tree { uri, id } => self
                .ctx
                .provider(uri)
                .ok()
                .and_then(|provider| provider.stat(id))
                .map(|entry| entry.is_directory)
                .unwrap_or(false),
        }
    }

    /// `true` once the provider stops resolving the tree to a name, which is how revoked
    /// access shows up.
    pub fn is_invalid_document_storage(&self) -> bool {
        match &self.root {
            Root::Direct { .. } => false,
            Root::Tree { uri, id } => self
                .ctx
                .provider(uri)
                .ok()
                .and_then(|provider| provider.display_name(id))
                .is_none(),
        }
    }

    pub fn can_write(&self) -> bool {
        match &self.root {
            Root::Direct { path } => fs::metadata(path)
                .map(|meta| meta.is_dir() && !meta.permissions().readonly())
                .unwrap_or(false),
            Root::Tree { uri, id } => self
                .ctx
                .provider(uri)
                .ok()
                .and_then(|provider| provider.stat(id))
                .map(|entry| entry.writable)
                .unwrap_or(false),
        }
    }

    /// Creates the directory if needed. Trees always exist once opened.
    pub fn mkdirs(&self) -> bool {
        match &self.root {
            Root::Direct { path } => path.is_dir() || fs::create_dir_all(path).is_ok(),
            Root::Tree { .. } => self.exists(),
        }
    }

    /// Creates `name`, reusing an existing file and deleting a directory in its way.
    pub fn create_file(&self, name: &str, mime_type: Option<&str>) -> CoreResult<StorageLocation> {
        match &self.root {
            Root::Direct { path } => StorageLocation::create_direct(
                self.ctx.clone(),
                path,
                name,
                mime_type,
                self.tag.clone(),
            ),
            Root::Tree { uri, id } => StorageLocation::create_document(
                self.ctx.clone(),
                uri,
                id,
                name,
                mime_type,
                false,
                self.tag.clone(),
            ),
        }
    }

    /// Creates a file named after `name` that does not collide, case-insensitively, with
    /// anything already in the directory: `name`, then `base(1).ext`, `base(2).ext`, ...
    pub fn create_unique_file(
        &self,
        name: &str,
        mime_type: Option<&str>,
    ) -> CoreResult<StorageLocation> {
        let (base, _) = split_name(name);
        let taken = self.names_with_prefix(base)?;
        let (unique, free) = pick_unique_name(
            name,
            &taken,
            self.ctx.config().unique_name_attempts,
            now_millis(),
        );
        debug!(requested = name, chosen = %unique, "picked unique file name");

        match &self.root {
            Root::Direct { path } => StorageLocation::create_direct(
                self.ctx.clone(),
                path,
                &unique,
                mime_type,
                self.tag.clone(),
            ),
            Root::Tree { uri, id } => StorageLocation::create_document(
                self.ctx.clone(),
                uri,
                id,
                &unique,
                mime_type,
                free,
                self.tag.clone(),
            ),
        }
    }

    /// URI of the file called `name`, matched case-insensitively.
    pub fn find_file(&self, name: &str) -> CoreResult<Option<Url>> {
        match &self.root {
            Root::Direct { path } => {
                let wanted = name.to_lowercase();
                let entries = match fs::read_dir(path) {
                    Ok(entries) => entries,
                    Err(_) => return Ok(None),
                };
                for entry in entries.flatten() {
                    let file_name = entry.file_name().to_string_lossy().to_string();
                    if file_name.to_lowercase() == wanted {
                        return Ok(Url::from_file_path(entry.path()).ok());
                    }
                }
                Ok(None)
            }
            Root::Tree { uri, id } => {
                let provider = self.ctx.provider(uri)?;
                let found = provider
                    .query_children(id, &ChildQuery::Exact(name.to_string()))?
                    .into_iter()
                    .next();
                match found {
                    Some(entry) => Ok(Some(build_document_uri_using_tree(uri, &entry.id)?)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Lowercased names of the entries starting with `prefix`. Trees are filtered by the
    /// provider so only matching rows come back.
    fn names_with_prefix(&self, prefix: &str) -> CoreResult<HashSet<String>> {
        let prefix = prefix.to_lowercase();
        match &self.root {
            Root::Direct { path } => {
                let entries =
                    fs::read_dir(path).map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
                Ok(entries
                    .flatten()
                    .map(|entry| entry.file_name().to_string_lossy().to_lowercase())
                    .filter(|name| name.starts_with(&prefix))
                    .collect())
            }
            Root::Tree { uri, id } => {
                let provider = self.ctx.provider(uri)?;
                Ok(provider
                    .query_children(id, &ChildQuery::Prefix(prefix))?
                    .into_iter()
                    .map(|entry| entry.display_name.to_lowercase())
                    .collect())
            }
        }
    }
}

impl std::fmt::Debug for StorageDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.root {
            Root::Direct { path } => write!(f, "path={} tag={:?}", path.display(), self.tag),
            Root::Tree { uri, .. } => write!(f, "tree={} tag={:?}", uri, self.tag),
        }
    }
}

/// Chooses a name that is not in `taken` (lowercased names). The flag is `true` when the
/// name is known to be free; the timestamp fallback is not checked, so whatever already
/// sits under it gets reused.
pub(crate) fn pick_unique_name(
    name: &str,
    taken: &HashSet<String>,
    attempts: u32,
    now: u128,
) -> (String, bool) {
    if !taken.contains(&name.to_lowercase()) {
        return (name.to_string(), true);
    }
    let (base, extension) = split_name(name);
    let numbered = (1..attempts)
        .map(|index| format!("{}({}){}", base, index, extension))
        .find(|candidate| !taken.contains(&candidate.to_lowercase()));
    match numbered {
        Some(candidate) => (candidate, true),
        None => {
            warn!(name, "ran out of numbered names, using a timestamp");
            (format!("{}{}", now, extension), false)
        }
    }
}

/// Splits `video.mp4` into `("video", ".mp4")`. Names without a dot, or ending in one,
/// keep an empty extension.
pub(crate) fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(index) if index > 0 && index + 1 < name.len() => name.split_at(index),
        _ => (name, ""),
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
