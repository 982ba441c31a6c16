//! Codec for the resumable-upload `Upload-Metadata` header.
//!
//! The header carries comma-separated pairs of `key base64(value)`; a key may
//! appear without a value. Keys are ASCII, non-empty, and contain neither
//! spaces nor commas.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{VaultError, VaultResult};

/// Parse an `Upload-Metadata` header into a key → decoded value map.
pub fn parse_upload_metadata(header: &str) -> VaultResult<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for raw_pair in header.split(',') {
        let raw_pair = raw_pair.trim();
        if raw_pair.is_empty() {
            continue;
        }

        let mut parts = raw_pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default();
        if key.is_empty() || !key.is_ascii() {
            return Err(VaultError::Validation(format!(
                "invalid Upload-Metadata key: {:?}",
                key
            )));
        }

        let value = match parts.next().map(str::trim) {
            None | Some("") => String::new(),
            Some(encoded) => {
                let bytes = STANDARD.decode(encoded).map_err(|e| {
                    VaultError::Validation(format!("Upload-Metadata value for '{}': {}", key, e))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    VaultError::Validation(format!(
                        "Upload-Metadata value for '{}' is not UTF-8",
                        key
                    ))
                })?
            }
        };

        if pairs.insert(key.to_string(), value).is_some() {
            return Err(VaultError::Validation(format!(
                "duplicate Upload-Metadata key: {}",
                key
            )));
        }
    }
    Ok(pairs)
}

/// Encode a key → value map as an `Upload-Metadata` header value.
pub fn encode_upload_metadata<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.to_string()
            } else {
                format!("{} {}", k, STANDARD.encode(v.as_bytes()))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Metadata an upload session needs, extracted from the header pairs.
///
/// The original filename is kept verbatim here; it is only sanitized when it
/// is later used to build a repository path.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub project_id: String,
    pub target_folder_path: String,
    pub original_filename: String,
    pub mime_type: String,
}

impl UploadMetadata {
    /// Extract the required fields. `filename`, `filetype`, and `projectId`
    /// are mandatory; `targetFolderPath` defaults to the repository root.
    pub fn from_pairs(pairs: &BTreeMap<String, String>) -> VaultResult<Self> {
        let required = |key: &str| -> VaultResult<String> {
            pairs
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| VaultError::Validation(format!("missing '{}' in Upload-Metadata", key)))
        };

        Ok(UploadMetadata {
            project_id: required("projectId")?,
            original_filename: required("filename")?,
            mime_type: required("filetype")?,
            target_folder_path: pairs
                .get("targetFolderPath")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| ".".to_string()),
        })
    }
}
