//! Project manifest committed at the root of every new repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILENAME: &str = "manifest.json";
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    pub owner_id: String,
    pub project_id: String,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl ProjectManifest {
    pub fn new(owner_id: &str, project_id: &str, project_name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            project_id: project_id.to_string(),
            project_name: project_name.to_string(),
            created_at,
            schema_version: MANIFEST_SCHEMA_VERSION,
        }
    }

    /// Pretty JSON with a trailing newline, as written to `manifest.json`.
    pub fn to_file_contents(&self) -> serde_json::Result<String> {
        let mut body = serde_json::to_string_pretty(self)?;
        body.push('\n');
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_contents_use_camel_case() {
        let m = ProjectManifest::new("u1", "p1", "Thesis", Utc::now());
        let body = m.to_file_contents().unwrap();
        assert!(body.contains("\"ownerId\": \"u1\""));
        assert!(body.contains("\"schemaVersion\": 1"));
        assert!(body.ends_with('\n'));
        let back: ProjectManifest = serde_json::from_str(&body).unwrap();
        assert_eq!(back, m);
    }
}
