use crate::error::CommonError;
use sha2::{Digest, Sha256};

pub const SHA256_PREFIX: &str = "sha256:";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `sha256:<hex>` digest of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("{SHA256_PREFIX}{}", sha256_hex(bytes))
}

/// Hash several string parts as one concatenated byte stream.
pub fn sha256_concat<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    hex::encode(hasher.finalize())
}

pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Validate a `sha256:<hex>` digest and return the hex part.
pub fn split_digest(digest: &str) -> Result<&str, CommonError> {
    digest
        .strip_prefix(SHA256_PREFIX)
        .filter(|hex| is_sha256_hex(hex))
        .ok_or_else(|| CommonError::InvalidDigest(digest.to_string()))
}

pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<(), CommonError> {
    let expected_hex = split_digest(expected).unwrap_or(expected);
    let actual = sha256_hex(bytes);
    if actual != expected_hex.to_ascii_lowercase() {
        return Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: format!("{SHA256_PREFIX}{actual}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn hashes_empty_input() {
        assert_eq!(sha256_hex(b""), EMPTY);
        assert_eq!(sha256_digest(b""), format!("sha256:{EMPTY}"));
    }

    #[test]
    fn concat_matches_single_buffer() {
        assert_eq!(sha256_concat(["ab", "cd"]), sha256_hex(b"abcd"));
    }

    #[test]
    fn split_digest_validates() {
        assert_eq!(split_digest(&format!("sha256:{EMPTY}")).unwrap(), EMPTY);
        assert!(split_digest(EMPTY).is_err());
        assert!(split_digest("sha256:abc").is_err());
        assert!(split_digest(&format!("sha256:{}", EMPTY.to_uppercase())).is_err());
    }

    #[test]
    fn verify_reports_mismatch() {
        assert!(verify_sha256(b"", EMPTY).is_ok());
        let err = verify_sha256(b"x", EMPTY).unwrap_err();
        assert!(matches!(err, CommonError::ChecksumMismatch { .. }));
    }
}
