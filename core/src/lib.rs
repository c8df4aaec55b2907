mod buffered;

pub mod checksum;
pub mod config;
pub mod context;
pub mod directory;
pub mod document;
pub mod error;
pub mod file_stream;
pub mod grants;
pub mod local_provider;
pub mod location;
pub mod segment;
pub mod stream;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::buffered::WriteErrorHandler;
pub use crate::config::AssemblyConfig;
pub use crate::context::StorageContext;
pub use crate::directory::StorageDirectory;
pub use crate::error::{CoreError, CoreResult};
pub use crate::file_stream::FileStream;
pub use crate::location::{LocationRecord, StorageLocation};
pub use crate::segment::SegmentReader;
pub use crate::stream::{Capabilities, StorageStream};
pub use crate::writer::{OffsetChecker, ProgressReport, SequentialWriter};
