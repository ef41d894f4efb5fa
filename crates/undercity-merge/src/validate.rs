//! Restrictive character-class validation for repository paths used as a
//! `git fetch` remote argument. Distinct from `undercity_git::validate`'s
//! ref/path validators because a fetch remote is an absolute filesystem
//! path, not a ref or an in-repo relative path.

use crate::error::MergeError;

/// Accepts an absolute path built only from alphanumerics, `_`, `-`,
/// `.`, and `/`, with no `..` traversal segment.
pub fn validate_repo_path(path: &str) -> Result<(), MergeError> {
    let ok = !path.is_empty()
        && !path.contains("..")
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
    if ok {
        Ok(())
    } else {
        Err(MergeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("`{path}` is not a valid repository path for a fetch remote"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_absolute_repo_path() {
        validate_repo_path("/home/user/repo").unwrap();
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_repo_path("/home/user/../etc").is_err());
    }
}
