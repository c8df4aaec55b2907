use serde::{Deserialize, Serialize};

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::CoreResult;
use crate::segment::SegmentReader;
use crate::stream::StorageStream;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

/// Hex digest of everything left in `reader`.
pub fn segment_digest(reader: &mut SegmentReader, kind: ChecksumType) -> CoreResult<String> {
    match kind {
        ChecksumType::Md5 => digest_with::<Md5>(reader),
        ChecksumType::Sha1 => digest_with::<Sha1>(reader),
        ChecksumType::Sha256 => digest_with::<Sha256>(reader),
    }
}

pub fn verify_segment(reader: &mut SegmentReader, req: &ChecksumRequest) -> CoreResult<bool> {
    let actual = segment_digest(reader, req.checksum_type)?;
    Ok(actual.eq_ignore_ascii_case(req.expected_hex.trim()))
}

fn digest_with<D: Digest>(reader: &mut SegmentReader) -> CoreResult<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
