use crate::TransferError;

/// Longest object key accepted, in bytes.
pub const MAX_KEY_LEN: usize = 1023;

/// Validates a destination object key before any request is made.
///
/// Rejects:
/// - Empty keys and keys longer than [`MAX_KEY_LEN`] bytes
/// - Keys starting with `/` or `\`
/// - Control characters
/// - `.` and `..` segments, which some stores normalize away
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidKey("empty key".into()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidKey(format!(
            "key is {} bytes, maximum is {MAX_KEY_LEN}",
            key.len()
        )));
    }

    if key.starts_with('/') || key.starts_with('\\') {
        return Err(TransferError::InvalidKey(format!(
            "key must not start with a separator: {key}"
        )));
    }

    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidKey(format!(
            "key contains control characters: {key:?}"
        )));
    }

    for segment in key.split('/') {
        if segment == "." || segment == ".." {
            return Err(TransferError::InvalidKey(format!(
                "relative segment not allowed: {key}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key() {
        assert!(validate_object_key("").is_err());
    }

    #[test]
    fn rejects_leading_separator() {
        assert!(validate_object_key("/backups/db.tar").is_err());
        assert!(validate_object_key("\\backups\\db.tar").is_err());
    }

    #[test]
    fn rejects_relative_segments() {
        assert!(validate_object_key("a/../b").is_err());
        assert!(validate_object_key("./b").is_err());
        assert!(validate_object_key("..").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_object_key("line\nbreak").is_err());
    }

    #[test]
    fn rejects_overlong_key() {
        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(validate_object_key(&key).is_err());
        assert!(validate_object_key(&key[1..]).is_ok());
    }

    #[test]
    fn accepts_nested_key() {
        assert!(validate_object_key("backups/2024/db.tar.gz").is_ok());
    }

    #[test]
    fn accepts_dotfile_and_unicode() {
        assert!(validate_object_key(".config/settings.json").is_ok());
        assert!(validate_object_key("数据/文件.bin").is_ok());
    }

    #[test]
    fn accepts_trailing_slash() {
        assert!(validate_object_key("folder/").is_ok());
    }
}
