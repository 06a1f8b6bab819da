use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Compares `content` against a declared checksum. Accepts an optional
/// `sha256:` prefix and either hex case.
pub fn verify(content: &[u8], declared: &str) -> bool {
    let declared = declared.trim();
    let declared = declared.strip_prefix("sha256:").unwrap_or(declared);
    declared.eq_ignore_ascii_case(&sha256_hex(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_accepts_prefix_and_case() {
        let digest = sha256_hex(b"payload");
        assert!(verify(b"payload", &digest));
        assert!(verify(b"payload", &digest.to_uppercase()));
        assert!(verify(b"payload", &format!("sha256:{}", digest)));
        assert!(!verify(b"tampered", &digest));
        assert!(!verify(b"payload", ""));
    }
}
