//! User-Password hiding per RFC 2865 Section 5.2
//!
//! The password is processed in 16-byte segments: the first segment is
//! XORed with MD5(secret + request authenticator), each following segment
//! with MD5(secret + previous ciphertext segment). Tunnel-Password
//! (RFC 2868) re-encryption runs through the same transform here, as the
//! proxy only ever moves the attribute between secrets without looking at
//! the salt.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyWrapError {
    #[error("invalid password attribute length {0}")]
    InvalidPasswordLength(usize),
    #[error("invalid key attribute length {0}")]
    InvalidKeyLength(usize),
}

fn md5_cat(secret: &[u8], tail: &[u8]) -> [u8; 16] {
    let mut data = Vec::with_capacity(secret.len() + tail.len());
    data.extend_from_slice(secret);
    data.extend_from_slice(tail);
    md5::compute(&data).0
}

/// Encrypt in place. `pwd` holds plaintext segments and must be a non-empty
/// multiple of 16 bytes.
pub fn encrypt_in_place(pwd: &mut [u8], secret: &[u8], auth: &[u8; 16]) {
    debug_assert!(!pwd.is_empty() && pwd.len() % 16 == 0);
    let mut chain: [u8; 16] = *auth;
    for segment in pwd.chunks_mut(16) {
        let hash = md5_cat(secret, &chain);
        for (byte, key) in segment.iter_mut().zip(hash) {
            *byte ^= key;
        }
        chain.copy_from_slice(segment);
    }
}

/// Decrypt in place. The chain input is the received ciphertext segment,
/// so it is saved before the XOR undoes it.
pub fn decrypt_in_place(pwd: &mut [u8], secret: &[u8], auth: &[u8; 16]) {
    debug_assert!(!pwd.is_empty() && pwd.len() % 16 == 0);
    let mut chain: [u8; 16] = *auth;
    for segment in pwd.chunks_mut(16) {
        let hash = md5_cat(secret, &chain);
        chain.copy_from_slice(segment);
        for (byte, key) in segment.iter_mut().zip(hash) {
            *byte ^= key;
        }
    }
}

/// Move a password attribute between secrets.
///
/// Decrypts under the origin secret and request authenticator, encrypts
/// under the destination secret and the fresh authenticator. The length is
/// never changed; anything outside 16..=128 or off a 16-byte boundary is
/// rejected before touching the buffer.
pub fn recrypt(
    pwd: &mut [u8],
    old_secret: &[u8],
    new_secret: &[u8],
    old_auth: &[u8; 16],
    new_auth: &[u8; 16],
) -> Result<(), KeyWrapError> {
    if pwd.is_empty() || pwd.len() > 128 || pwd.len() % 16 != 0 {
        return Err(KeyWrapError::InvalidPasswordLength(pwd.len()));
    }
    decrypt_in_place(pwd, old_secret, old_auth);
    encrypt_in_place(pwd, new_secret, new_auth);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let secret = b"testing123";
        let auth = [5u8; 16];
        // every permitted length
        for segments in 1..=8usize {
            let plain: Vec<u8> = (0..segments * 16).map(|i| i as u8).collect();
            let mut buf = plain.clone();
            encrypt_in_place(&mut buf, secret, &auth);
            assert_ne!(buf, plain);
            decrypt_in_place(&mut buf, secret, &auth);
            assert_eq!(buf, plain, "round trip failed for {} bytes", plain.len());
        }
    }

    #[test]
    fn test_decrypt_then_encrypt_is_identity() {
        let secret = b"testing123";
        let auth = [9u8; 16];
        for segments in 1..=8usize {
            let cipher: Vec<u8> = (0..segments * 16).map(|i| (i * 7) as u8).collect();
            let mut buf = cipher.clone();
            decrypt_in_place(&mut buf, secret, &auth);
            encrypt_in_place(&mut buf, secret, &auth);
            assert_eq!(buf, cipher);
        }
    }

    #[test]
    fn test_recrypt_between_secrets() {
        let old_auth = [1u8; 16];
        let new_auth = [2u8; 16];
        let plain = b"correct horse bt"; // one segment

        let mut wire = plain.to_vec();
        encrypt_in_place(&mut wire, b"testing123", &old_auth);
        recrypt(&mut wire, b"testing123", b"up-secret", &old_auth, &new_auth).unwrap();
        decrypt_in_place(&mut wire, b"up-secret", &new_auth);
        assert_eq!(&wire, plain);
    }

    #[test]
    fn test_recrypt_rejects_bad_lengths() {
        let auth = [0u8; 16];
        for len in [0usize, 1, 15, 17, 144] {
            let mut buf = vec![0u8; len];
            assert!(recrypt(&mut buf, b"a", b"b", &auth, &auth).is_err());
        }
    }
}
