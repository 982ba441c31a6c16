//! Repository addressing and sanitization of user-controlled path parts.
//!
//! Every string that ends up in a filesystem path (filenames, folder paths,
//! owner ids used for staging partitions) passes through one of these
//! functions first. Nothing user-supplied is ever joined onto a path raw.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};

/// Fallback used when a filename sanitizes down to nothing.
pub const FALLBACK_FILENAME: &str = "unnamed_file";

const MAX_SEGMENT_CHARS: usize = 200;
const MAX_FOLDER_DEPTH: usize = 32;
const MAX_PROJECT_NAME_CHARS: usize = 100;

/// Deterministic, filesystem-safe identifier of a project's bare repository.
///
/// Lowercase hex SHA-256 over `owner_id`, a NUL separator, and `project_id`.
/// The separator keeps `("ab", "c")` and `("a", "bc")` apart.
pub fn repo_hash(owner_id: &str, project_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(project_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Location of a bare repository relative to the repositories root.
///
/// Sharded by the first two hex characters: `ab/abcdef….git`.
pub fn repo_relative_path(repo_hash: &str) -> PathBuf {
    let shard = repo_hash.get(..2).unwrap_or("00");
    PathBuf::from(shard).join(format!("{}.git", repo_hash))
}

fn allowed_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')' | '+')
}

/// Sanitize one path segment. Returns an empty string when nothing survives.
///
/// Path separators and anything outside the allow-list become `_`, runs of
/// `_` collapse to one, and leading/trailing dots and whitespace are removed.
pub fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let c = if allowed_char(c) { c } else { '_' };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches(|c: char| c == '.' || c.is_whitespace());
    trimmed.chars().take(MAX_SEGMENT_CHARS).collect::<String>()
}

/// Sanitize an uploaded filename for use inside a repository tree.
///
/// Never returns an empty string.
pub fn sanitize_filename(raw: &str) -> String {
    let sanitized = sanitize_segment(raw);
    if sanitized.is_empty() || sanitized == "_" {
        FALLBACK_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Normalize a client-supplied target folder into a relative `a/b/c` path.
///
/// Both `/` and `\` separate segments. Empty and `.` segments are dropped;
/// `..` is rejected outright rather than silently rewritten. An empty result
/// means the repository root.
pub fn sanitize_folder_path(raw: &str) -> VaultResult<String> {
    let mut segments = Vec::new();
    for part in raw.split(['/', '\\']) {
        let part = part.trim();
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            return Err(VaultError::Validation(format!(
                "target folder may not contain '..': {}",
                raw
            )));
        }
        let clean = sanitize_segment(part);
        if clean.is_empty() || clean == "_" {
            continue;
        }
        segments.push(clean);
    }

    if segments.len() > MAX_FOLDER_DEPTH {
        return Err(VaultError::Validation(format!(
            "target folder is nested deeper than {} levels",
            MAX_FOLDER_DEPTH
        )));
    }

    Ok(segments.join("/"))
}

/// Validate a human-facing project name. Returns the trimmed name.
pub fn validate_project_name(raw: &str) -> VaultResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(VaultError::Validation("project name is required".into()));
    }
    if name.chars().count() > MAX_PROJECT_NAME_CHARS {
        return Err(VaultError::Validation(format!(
            "project name must be at most {} characters",
            MAX_PROJECT_NAME_CHARS
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.')))
    {
        return Err(VaultError::Validation(format!(
            "project name contains disallowed character {:?}",
            bad
        )));
    }
    Ok(name.to_string())
}

/// Validate an opaque caller identity before it is used as a partition key.
pub fn validate_owner_id(raw: &str) -> VaultResult<&str> {
    let owner = raw.trim();
    if owner.is_empty() {
        return Err(VaultError::Validation("owner id is required".into()));
    }
    if owner.chars().any(char::is_control) {
        return Err(VaultError::Validation(
            "owner id contains control characters".into(),
        ));
    }
    Ok(owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_hash_is_pure() {
        assert_eq!(repo_hash("user-1", "proj-1"), repo_hash("user-1", "proj-1"));
        assert_eq!(repo_hash("user-1", "proj-1").len(), 64);
        assert!(repo_hash("u", "p").chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn repo_hash_separates_fields() {
        assert_ne!(repo_hash("ab", "c"), repo_hash("a", "bc"));
        assert_ne!(repo_hash("user-1", "proj-1"), repo_hash("user-1", "proj-2"));
    }

    #[test]
    fn repo_path_is_sharded() {
        let hash = repo_hash("user-1", "proj-1");
        let rel = repo_relative_path(&hash);
        assert_eq!(rel, PathBuf::from(&hash[..2]).join(format!("{}.git", hash)));
    }

    #[test]
    fn filename_strips_separators_and_dots() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("..\\..\\boot.ini"), "_.._boot.ini");
        assert!(!sanitize_filename("../../etc/passwd").contains('/'));
        assert_eq!(sanitize_filename("...hidden..."), "hidden");
        assert_eq!(sanitize_filename("report  final.pdf"), "report  final.pdf");
    }

    #[test]
    fn filename_collapses_replacements() {
        assert_eq!(sanitize_filename("a::??b.txt"), "a_b.txt");
        assert_eq!(sanitize_filename("a___b"), "a_b");
    }

    #[test]
    fn filename_falls_back_when_empty() {
        assert_eq!(sanitize_filename(""), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename(".."), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename("///"), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename("   "), FALLBACK_FILENAME);
    }

    #[test]
    fn filename_keeps_unicode_letters() {
        assert_eq!(sanitize_filename("Übersicht.md"), "Übersicht.md");
    }

    #[test]
    fn folder_path_normalizes() {
        assert_eq!(sanitize_folder_path(".").unwrap(), "");
        assert_eq!(sanitize_folder_path("").unwrap(), "");
        assert_eq!(sanitize_folder_path("/docs//specs/").unwrap(), "docs/specs");
        assert_eq!(sanitize_folder_path("docs\\img").unwrap(), "docs/img");
        assert_eq!(sanitize_folder_path("./.git/hooks").unwrap(), "git/hooks");
    }

    #[test]
    fn folder_path_rejects_parent_refs() {
        let err = sanitize_folder_path("docs/../../etc").unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn project_name_rules() {
        assert_eq!(validate_project_name("  My Thesis  ").unwrap(), "My Thesis");
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name("a/b").is_err());
        assert!(validate_project_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn owner_id_rules() {
        assert_eq!(validate_owner_id(" 42 ").unwrap(), "42");
        assert!(validate_owner_id("").is_err());
        assert!(validate_owner_id("a\nb").is_err());
    }
}
