//! Indirect storage: documents handed out by a permission-scoped provider.
//!
//! Documents are addressed through `content://<authority>/tree/<tree-id>` URIs, optionally
//! followed by `/document/<document-id>`. Identifiers are opaque to callers; only the
//! provider knows how they map onto real storage.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use url::Url;

use crate::error::{CoreError, CoreResult};
use crate::stream::{Capabilities, StorageStream};

pub const CONTENT_SCHEME: &str = "content";
pub const FILE_SCHEME: &str = "file";
pub const DEFAULT_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    pub id: String,
    pub display_name: String,
    pub mime_type: Option<String>,
    pub is_directory: bool,
    pub size: u64,
    pub writable: bool,
}

/// Name filter applied by the provider while listing a directory. Matching is
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildQuery {
    Exact(String),
    Prefix(String),
}

impl ChildQuery {
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        match self {
            ChildQuery::Exact(wanted) => name == wanted.to_lowercase(),
            ChildQuery::Prefix(prefix) => name.starts_with(&prefix.to_lowercase()),
        }
    }
}

/// Handle returned when a document is opened.
pub enum Descriptor {
    /// Dedicated read/write descriptor, seekable and truncatable.
    ReadWrite(File),
    /// Pipe-like handle that can only be consumed front to back.
    StreamOnly(Box<dyn Read + Send>),
}

pub trait DocumentProvider: Send + Sync {
    fn authority(&self) -> &str;

    /// Persists the permission the user granted for `uri` so it survives restarts.
    fn take_persistable_permission(&self, uri: &Url) -> CoreResult<()>;

    /// Root document id of a tree URI, or `None` when the tree cannot be used.
    fn tree_root(&self, tree_uri: &Url) -> Option<String>;

    /// `None` when the document is missing or access to it was revoked.
    fn stat(&self, document_id: &str) -> Option<DocumentEntry>;

    fn display_name(&self, document_id: &str) -> Option<String> {
        self.stat(document_id).map(|entry| entry.display_name)
    }

    fn parent_document(&self, document_id: &str) -> Option<String>;

    fn query_children(&self, parent_id: &str, query: &ChildQuery) -> CoreResult<Vec<DocumentEntry>>;

    fn create_document(&self, parent_id: &str, mime_type: &str, name: &str) -> CoreResult<String>;

    fn create_directory(&self, parent_id: &str, name: &str) -> CoreResult<String>;

    fn delete_document(&self, document_id: &str) -> CoreResult<bool>;

    fn open_descriptor(&self, document_id: &str) -> CoreResult<Descriptor>;
}

pub fn build_tree_uri(authority: &str, tree_id: &str) -> CoreResult<Url> {
    let mut url = Url::parse(&format!("{}://{}/", CONTENT_SCHEME, authority))
        .map_err(|err| CoreError::InvalidTree(format!("{}: {}", authority, err)))?;
    url.path_segments_mut()
        .map_err(|_| CoreError::InvalidTree(authority.to_string()))?
        .clear()
        .push("tree")
        .push(tree_id);
    Ok(url)
}

pub fn build_document_uri_using_tree(tree_uri: &Url, document_id: &str) -> CoreResult<Url> {
    let tree_id = tree_document_id(tree_uri)
        .ok_or_else(|| CoreError::InvalidTree(tree_uri.to_string()))?;
    let mut url = tree_uri.clone();
    url.path_segments_mut()
        .map_err(|_| CoreError::InvalidTree(tree_uri.to_string()))?
        .clear()
        .push("tree")
        .push(&tree_id)
        .push("document")
        .push(document_id);
    Ok(url)
}

pub fn tree_document_id(uri: &Url) -> Option<String> {
    let segments: Vec<&str> = uri.path_segments()?.collect();
    match segments.as_slice() {
        ["tree", id, ..] if !id.is_empty() => Some(percent_decode(id)),
        _ => None,
    }
}

pub fn document_id(uri: &Url) -> Option<String> {
    let segments: Vec<&str> = uri.path_segments()?.collect();
    match segments.as_slice() {
        ["tree", _, "document", id] | ["document", id] if !id.is_empty() => {
            Some(percent_decode(id))
        }
        _ => None,
    }
}

pub fn is_content_uri(uri: &Url) -> bool {
    uri.scheme().eq_ignore_ascii_case(CONTENT_SCHEME)
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[index + 1]), hex_value(bytes[index + 2])) {
                out.push((hi << 4) | lo);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Stream over a provider descriptor.
///
/// Descriptors may shrink the document but never grow it through `set_length`; growth
/// happens by writing.
#[derive(Debug)]
pub struct DocumentStream {
    file: Option<File>,
    uri: Url,
}

impl DocumentStream {
    /// Wraps a freshly opened descriptor. Stream-only handles cannot seek and are rejected.
    pub fn acquire(descriptor: Descriptor, uri: Url) -> CoreResult<Self> {
        match descriptor {
            Descriptor::ReadWrite(file) => Ok(Self {
                file: Some(file),
                uri,
            }),
            Descriptor::StreamOnly(_) => Err(CoreError::Unsupported(format!(
                "{} only provides a stream handle, a seekable descriptor is required",
                uri
            ))),
        }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    fn file(&mut self) -> CoreResult<&mut File> {
        self.file.as_mut().ok_or(CoreError::Closed)
    }

    fn size(&mut self) -> CoreResult<u64> {
        Ok(self
            .file()?
            .metadata()
            .map_err(|err| CoreError::Io(err.to_string()))?
            .len())
    }

    fn position(&mut self) -> CoreResult<u64> {
        self.file()?
            .stream_position()
            .map_err(|err| CoreError::Io(err.to_string()))
    }
}

impl StorageStream for DocumentStream {
    fn capabilities(&self) -> Capabilities {
        Capabilities::random_access()
    }

    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        self.file()?
            .read(buf)
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn skip(&mut self, amount: u64) -> CoreResult<u64> {
        let position = self.position()?;
        let skipped = amount.min(self.size()?.saturating_sub(position));
        self.seek(position + skipped)?;
        Ok(skipped)
    }

    fn available(&mut self) -> CoreResult<u64> {
        let position = self.position()?;
        Ok(self.size()?.saturating_sub(position))
    }

    fn write(&mut self, buf: &[u8]) -> CoreResult<()> {
        self.file()?
            .write_all(buf)
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn flush(&mut self) -> CoreResult<()> {
        self.file()?
            .sync_data()
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn seek(&mut self, offset: u64) -> CoreResult<()> {
        self.file()?
            .seek(SeekFrom::Start(offset))
            .map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(())
    }

    fn rewind(&mut self) -> CoreResult<()> {
        self.seek(0)
    }

    fn set_length(&mut self, length: u64) -> CoreResult<()> {
        let size = self.size()?;
        if length > size {
            return Err(CoreError::Unsupported(format!(
                "{} cannot be extended to {} bytes by truncation (size {})",
                self.uri, length, size
            )));
        }
        self.file()?
            .set_len(length)
            .map_err(|err| CoreError::Io(err.to_string()))
    }

    fn length(&mut self) -> CoreResult<u64> {
        self.size()
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}
