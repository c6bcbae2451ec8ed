//! MS-MPPE key wrapping (RFC 2548 Section 2.4)
//!
//! The attribute value is a 2-byte salt followed by ciphertext in 16-byte
//! segments. The first key block is MD5(secret + request authenticator +
//! salt); each following block is MD5(secret + previous ciphertext
//! segment). Re-encryption keeps the salt and swaps secret/authenticator.

use crate::password::KeyWrapError;

fn key_block(secret: &[u8], auth: &[u8; 16], salt: &[u8; 2]) -> [u8; 16] {
    let mut data = Vec::with_capacity(secret.len() + 18);
    data.extend_from_slice(secret);
    data.extend_from_slice(auth);
    data.extend_from_slice(salt);
    md5::compute(&data).0
}

fn chain_block(secret: &[u8], prev_cipher: &[u8]) -> [u8; 16] {
    let mut data = Vec::with_capacity(secret.len() + 16);
    data.extend_from_slice(secret);
    data.extend_from_slice(prev_cipher);
    md5::compute(&data).0
}

/// Encrypt the key material (without the salt) in place.
pub fn encrypt_in_place(key: &mut [u8], secret: &[u8], auth: &[u8; 16], salt: &[u8; 2]) {
    debug_assert!(!key.is_empty() && key.len() % 16 == 0);
    let mut hash = key_block(secret, auth, salt);
    let mut chain = [0u8; 16];
    for segment in key.chunks_mut(16) {
        for (byte, k) in segment.iter_mut().zip(hash) {
            *byte ^= k;
        }
        chain.copy_from_slice(segment);
        hash = chain_block(secret, &chain);
    }
}

/// Decrypt the key material (without the salt) in place.
pub fn decrypt_in_place(key: &mut [u8], secret: &[u8], auth: &[u8; 16], salt: &[u8; 2]) {
    debug_assert!(!key.is_empty() && key.len() % 16 == 0);
    let mut hash = key_block(secret, auth, salt);
    let mut chain = [0u8; 16];
    for segment in key.chunks_mut(16) {
        chain.copy_from_slice(segment);
        for (byte, k) in segment.iter_mut().zip(hash) {
            *byte ^= k;
        }
        hash = chain_block(secret, &chain);
    }
}

/// Move an MS-MPPE key attribute value (salt + ciphertext) between secrets.
///
/// `old_auth` is the authenticator of the request the reply answers;
/// `new_auth` is the authenticator the rewritten reply will be bound to.
/// The salt is preserved and the length never changes.
pub fn recrypt(
    value: &mut [u8],
    old_secret: &[u8],
    new_secret: &[u8],
    old_auth: &[u8; 16],
    new_auth: &[u8; 16],
) -> Result<(), KeyWrapError> {
    if value.len() < 18 || (value.len() - 2) % 16 != 0 {
        return Err(KeyWrapError::InvalidKeyLength(value.len()));
    }
    let salt = [value[0], value[1]];
    let key = &mut value[2..];
    decrypt_in_place(key, old_secret, old_auth, &salt);
    encrypt_in_place(key, new_secret, new_auth, &salt);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let secret = b"up-secret";
        let auth = [4u8; 16];
        let salt = [0x80, 0x01];
        for segments in 1..=3usize {
            let plain: Vec<u8> = (0..segments * 16).map(|i| (i * 3) as u8).collect();
            let mut buf = plain.clone();
            encrypt_in_place(&mut buf, secret, &auth, &salt);
            assert_ne!(buf, plain);
            decrypt_in_place(&mut buf, secret, &auth, &salt);
            assert_eq!(buf, plain);
        }
    }

    #[test]
    fn test_decrypt_encrypt_same_parameters_is_identity() {
        let secret = b"up-secret";
        let auth = [4u8; 16];
        let mut value = vec![0x80, 0x01];
        value.extend((0..32).map(|i| i as u8));
        let original = value.clone();

        recrypt(&mut value, secret, secret, &auth, &auth).unwrap();
        assert_eq!(value, original);
    }

    #[test]
    fn test_recrypt_moves_between_secrets() {
        let old_auth = [1u8; 16];
        let new_auth = [2u8; 16];
        let salt = [0x80, 0x05];
        let plain = [0xABu8; 16];

        let mut wire = plain.to_vec();
        encrypt_in_place(&mut wire, b"up-secret", &old_auth, &salt);
        let mut value = salt.to_vec();
        value.extend_from_slice(&wire);

        recrypt(&mut value, b"up-secret", b"testing123", &old_auth, &new_auth).unwrap();
        assert_eq!(value[..2], salt);
        decrypt_in_place(&mut value[2..], b"testing123", &new_auth, &salt);
        assert_eq!(value[2..], plain);
    }

    #[test]
    fn test_recrypt_rejects_short_values() {
        let auth = [0u8; 16];
        for len in [0usize, 2, 17, 20] {
            let mut value = vec![0u8; len];
            assert!(recrypt(&mut value, b"a", b"b", &auth, &auth).is_err());
        }
    }

    #[test]
    fn test_salt_changes_ciphertext() {
        let secret = b"s";
        let auth = [0u8; 16];
        let mut a = [0x55u8; 16];
        let mut b = [0x55u8; 16];
        encrypt_in_place(&mut a, secret, &auth, &[0, 1]);
        encrypt_in_place(&mut b, secret, &auth, &[0, 2]);
        assert_ne!(a, b);
    }
}
