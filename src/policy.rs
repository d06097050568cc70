//! Per-purpose upload rules, checked before any storage I/O.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sniff::normalize_mime;

const MIB: u64 = 1024 * 1024;

/// What an upload is for. Selects the applicable policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Avatar,
    General,
    Embedded,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Avatar => "avatar",
            Purpose::General => "general",
            Purpose::Embedded => "embedded",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = PolicyViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avatar" => Ok(Purpose::Avatar),
            "general" => Ok(Purpose::General),
            "embedded" => Ok(Purpose::Embedded),
            _ => Err(PolicyViolation::UnknownPurpose(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("unknown upload purpose '{0}'")]
    UnknownPurpose(String),
    #[error("no upload policy configured for purpose '{0}'")]
    NoPolicy(Purpose),
    #[error("MIME type '{mime_type}' is not allowed for {purpose} uploads")]
    MimeNotAllowed { purpose: Purpose, mime_type: String },
    #[error("file of {size} bytes exceeds the {max} byte limit for {purpose} uploads")]
    TooLarge { purpose: Purpose, size: u64, max: u64 },
    #[error("empty uploads are not allowed")]
    Empty,
}

/// Rules for one purpose. Patterns are exact types or `type/*`; `*/*` allows anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurposeRule {
    pub allowed_types: Vec<String>,
    pub max_size: u64,
}

impl PurposeRule {
    pub fn new(allowed_types: &[&str], max_size: u64) -> Self {
        Self {
            allowed_types: allowed_types.iter().map(|t| t.to_string()).collect(),
            max_size,
        }
    }

    fn allows(&self, mime_type: &str) -> bool {
        let primary = mime_type.split('/').next().unwrap_or("");
        self.allowed_types.iter().any(|pattern| {
            pattern == "*/*"
                || pattern == mime_type
                || pattern
                    .strip_suffix("/*")
                    .is_some_and(|prefix| prefix == primary)
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    rules: HashMap<Purpose, PurposeRule>,
}

impl UploadPolicy {
    pub fn new(rules: HashMap<Purpose, PurposeRule>) -> Self {
        Self { rules }
    }

    /// Built-in rules. `max_upload_size` is the general limit and caps every other purpose.
    pub fn with_defaults(max_upload_size: u64, avatar_max_size: u64) -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            Purpose::Avatar,
            PurposeRule::new(
                &["image/jpeg", "image/png", "image/gif", "image/webp"],
                avatar_max_size.min(max_upload_size),
            ),
        );
        rules.insert(Purpose::General, PurposeRule::new(&["*/*"], max_upload_size));
        rules.insert(
            Purpose::Embedded,
            PurposeRule::new(
                &[
                    "image/*",
                    "video/mp4",
                    "video/webm",
                    "audio/*",
                    "application/pdf",
                ],
                (20 * MIB).min(max_upload_size),
            ),
        );
        Self { rules }
    }

    pub fn rule(&self, purpose: Purpose) -> Result<&PurposeRule, PolicyViolation> {
        self.rules
            .get(&purpose)
            .ok_or(PolicyViolation::NoPolicy(purpose))
    }

    /// Validate a declared MIME type and size for `purpose`.
    pub fn validate(&self, purpose: Purpose, mime_type: &str, size: u64) -> Result<(), PolicyViolation> {
        self.check_mime(purpose, mime_type)?;
        self.check_size(purpose, size)
    }

    pub fn check_mime(&self, purpose: Purpose, mime_type: &str) -> Result<(), PolicyViolation> {
        let rule = self.rule(purpose)?;
        let mime_type = normalize_mime(mime_type);
        if mime_type.is_empty() || !rule.allows(&mime_type) {
            return Err(PolicyViolation::MimeNotAllowed {
                purpose,
                mime_type,
            });
        }
        Ok(())
    }

    pub fn check_size(&self, purpose: Purpose, size: u64) -> Result<(), PolicyViolation> {
        let rule = self.rule(purpose)?;
        if size == 0 {
            return Err(PolicyViolation::Empty);
        }
        if size > rule.max_size {
            return Err(PolicyViolation::TooLarge {
                purpose,
                size,
                max: rule.max_size,
            });
        }
        Ok(())
    }
}
