use std::io::{Cursor, Read, Write};

use serde_json::Value;
use thiserror::Error;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::SnapshotBundle;
use crate::error::{codes, AppError};

/// Name of the single entry inside a packed snapshot.
pub const SNAPSHOT_ENTRY: &str = "snapshot.json";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bundle is {size} bytes, over the {limit} byte ceiling")]
    TooLarge { size: u64, limit: u64 },
    #[error("archive has no snapshot.json entry")]
    MissingEntry,
    #[error("archive error: {0}")]
    Zip(#[from] ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle json is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TooLarge { size, limit } => {
                AppError::new(codes::QUOTA_EXCEEDED, err.to_string())
                    .with_context("size", size.to_string())
                    .with_context("limit", limit.to_string())
            }
            other => AppError::new(codes::INVALID_SNAPSHOT, other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackedBundle {
    pub bytes: Vec<u8>,
    pub uncompressed_bytes: u64,
}

/// Serialize `bundle` and deflate it into a single-entry zip.
pub fn pack_bundle(bundle: &SnapshotBundle, limit: u64) -> Result<PackedBundle, CodecError> {
    let json = serde_json::to_vec(bundle)?;
    let uncompressed_bytes = json.len() as u64;
    if uncompressed_bytes > limit {
        return Err(CodecError::TooLarge {
            size: uncompressed_bytes,
            limit,
        });
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(SNAPSHOT_ENTRY, options)?;
    writer.write_all(&json)?;
    let bytes = writer.finish()?.into_inner();

    Ok(PackedBundle {
        bytes,
        uncompressed_bytes,
    })
}

/// Inflate packed bytes to the bundle JSON. Plain JSON input (a bundle saved
/// by hand) is accepted as-is. Both the input and the inflated stream are
/// held to `limit`.
pub fn unpack_bytes(bytes: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
    if bytes.len() as u64 > limit {
        return Err(CodecError::TooLarge {
            size: bytes.len() as u64,
            limit,
        });
    }
    if !bytes.starts_with(b"PK") {
        return Ok(bytes.to_vec());
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let entry = match archive.by_name(SNAPSHOT_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(CodecError::MissingEntry),
        Err(err) => return Err(err.into()),
    };
    let mut json = Vec::new();
    entry.take(limit + 1).read_to_end(&mut json)?;
    if json.len() as u64 > limit {
        return Err(CodecError::TooLarge {
            size: json.len() as u64,
            limit,
        });
    }
    Ok(json)
}

/// Unpack and parse into a JSON value, without interpreting it as a bundle,
/// so structural problems can be reported field by field.
pub fn read_bundle_value(bytes: &[u8], limit: u64) -> Result<(Value, u64), CodecError> {
    let json = unpack_bytes(bytes, limit)?;
    let size = json.len() as u64;
    Ok((serde_json::from_slice(&json)?, size))
}
