//! Object key codec.
//!
//! A key is the percent-encoded folder path followed by the file uid, with an
//! optional `@kind` suffix for variants:
//!
//! ```text
//! reports/2024/0b6f4c1e-...            original
//! reports/2024/0b6f4c1e-...@thumbnail  variant
//! ```
//!
//! Segment bytes outside `[A-Za-z0-9_.-]` are percent-encoded and a leading
//! `.` is always encoded, so no decoded segment can be `.`, `..` or contain a
//! separator. `decode(encode(x)) == x` for every accepted input, and `decode`
//! rejects keys that are not in canonical form.

use thiserror::Error;

use crate::storage::models::VariantKind;

const MAX_SEGMENTS: usize = 16;
const MAX_SEGMENT_LEN: usize = 255;
const MAX_UID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid file uid '{0}'")]
    InvalidUid(String),
    #[error("invalid folder segment '{0}'")]
    InvalidSegment(String),
    #[error("folder is nested too deeply")]
    TooDeep,
    #[error("invalid bucket name '{0}'")]
    InvalidBucket(String),
    #[error("malformed object key '{0}'")]
    Malformed(String),
}

/// Parts recovered from an encoded key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub folder: Vec<String>,
    pub file_uid: String,
    pub variant: Option<VariantKind>,
}

/// Encode a storage key from a folder path, file uid and optional variant kind.
pub fn encode(folder: &str, file_uid: &str, variant: Option<VariantKind>) -> Result<String, KeyError> {
    validate_uid(file_uid)?;
    let segments = split_folder(folder)?;

    let mut key = String::new();
    for segment in &segments {
        key.push_str(&encode_segment(segment));
        key.push('/');
    }
    key.push_str(file_uid);
    if let Some(kind) = variant {
        key.push('@');
        key.push_str(kind.as_str());
    }
    Ok(key)
}

/// Decode a key produced by [`encode`].
pub fn decode(key: &str) -> Result<DecodedKey, KeyError> {
    let malformed = || KeyError::Malformed(key.to_string());

    let mut parts: Vec<&str> = key.split('/').collect();
    let last = parts.pop().ok_or_else(malformed)?;

    let (file_uid, variant) = match last.split_once('@') {
        Some((uid, kind)) => (uid, Some(kind.parse::<VariantKind>().map_err(|_| malformed())?)),
        None => (last, None),
    };
    validate_uid(file_uid)?;

    let folder = parts
        .into_iter()
        .map(|p| decode_segment(p).ok_or_else(malformed))
        .collect::<Result<Vec<_>, _>>()?;

    let decoded = DecodedKey {
        folder,
        file_uid: file_uid.to_string(),
        variant,
    };

    // Only canonical encodings are accepted.
    if encode(&decoded.folder.join("/"), &decoded.file_uid, decoded.variant)? != key {
        return Err(malformed());
    }
    Ok(decoded)
}

/// Path-confinement check used by filesystem backends: every segment must be a
/// plain name.
pub fn check_relative(key: &str) -> Result<(), KeyError> {
    if key.is_empty() || key.starts_with('/') {
        return Err(KeyError::Malformed(key.to_string()));
    }
    for segment in key.split('/') {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains(['\\', '\0', ':'])
        {
            return Err(KeyError::Malformed(key.to_string()));
        }
    }
    Ok(())
}

/// S3-style bucket name rules: 3-63 chars of `[a-z0-9.-]`, alphanumeric at
/// both ends, no `..`.
pub fn validate_bucket(bucket: &str) -> Result<(), KeyError> {
    let bytes = bucket.as_bytes();
    let valid = (3..=63).contains(&bytes.len())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'.' || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && !bucket.contains("..");
    if valid {
        Ok(())
    } else {
        Err(KeyError::InvalidBucket(bucket.to_string()))
    }
}

fn validate_uid(uid: &str) -> Result<(), KeyError> {
    let valid = !uid.is_empty()
        && uid.len() <= MAX_UID_LEN
        && uid.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(KeyError::InvalidUid(uid.to_string()))
    }
}

fn split_folder(folder: &str) -> Result<Vec<String>, KeyError> {
    let segments: Vec<String> = folder
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if segments.len() > MAX_SEGMENTS {
        return Err(KeyError::TooDeep);
    }
    for segment in &segments {
        if segment == "." || segment == ".." || segment.contains(['\\', '\0']) {
            return Err(KeyError::InvalidSegment(segment.clone()));
        }
        if encode_segment(segment).len() > MAX_SEGMENT_LEN {
            return Err(KeyError::InvalidSegment(segment.clone()));
        }
    }
    Ok(segments)
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, b) in segment.bytes().enumerate() {
        let plain = b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && i > 0);
        if plain {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_segment(segment: &str) -> Option<String> {
    if segment.is_empty() {
        return None;
    }
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
