//! AES-128-CFB8 stream cipher used once a connection is encrypted.
//!
//! CFB8 encrypts/decrypts one byte at a time, using the previous ciphertext
//! byte to update the IV for the next byte. Both the key and the IV are the
//! 16-byte shared secret negotiated during login.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};

/// Length of the shared secret in bytes.
pub const SHARED_SECRET_LEN: usize = 16;

/// AES-128-CFB8 cipher state for one direction of a connection.
pub struct Cfb8Cipher {
    cipher: Aes128,
    iv: [u8; 16],
}

impl Cfb8Cipher {
    /// Create a new CFB8 cipher with the given key and IV.
    #[must_use]
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        Self { cipher, iv: *iv }
    }

    /// Create a cipher keyed the way Minecraft does it (key = IV = secret).
    #[must_use]
    pub fn from_shared_secret(secret: &[u8; SHARED_SECRET_LEN]) -> Self {
        Self::new(secret, secret)
    }

    /// Keystream byte for the current IV.
    fn keystream_byte(&self) -> u8 {
        let mut block = GenericArray::clone_from_slice(&self.iv);
        self.cipher.encrypt_block(&mut block);
        block[0]
    }

    /// Shift the IV left by 1 byte and append the ciphertext byte.
    fn feed(&mut self, ciphertext_byte: u8) {
        self.iv.copy_within(1.., 0);
        self.iv[15] = ciphertext_byte;
    }

    /// Encrypt data in place.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let ciphertext_byte = *byte ^ self.keystream_byte();
            *byte = ciphertext_byte;
            self.feed(ciphertext_byte);
        }
    }

    /// Decrypt data in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let ciphertext_byte = *byte;
            *byte ^= self.keystream_byte();
            self.feed(ciphertext_byte);
        }
    }
}

impl std::fmt::Debug for Cfb8Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cfb8Cipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfb8_cipher_roundtrip() {
        let key = [0x01u8; 16];
        let iv = [0x02u8; 16];

        let mut encryptor = Cfb8Cipher::new(&key, &iv);
        let mut decryptor = Cfb8Cipher::new(&key, &iv);

        let original = b"Hello, Minecraft!".to_vec();
        let mut data = original.clone();

        encryptor.encrypt(&mut data);
        assert_ne!(data, original);

        decryptor.decrypt(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_stream_is_chunking_independent() {
        let secret = [0x5au8; 16];
        let original: Vec<u8> = (0..=255).collect();

        let mut whole = original.clone();
        Cfb8Cipher::from_shared_secret(&secret).encrypt(&mut whole);

        // Decrypting in arbitrary slices must match decrypting in one go
        let mut chunked = whole.clone();
        let mut decryptor = Cfb8Cipher::from_shared_secret(&secret);
        for chunk in chunked.chunks_mut(7) {
            decryptor.decrypt(chunk);
        }
        assert_eq!(chunked, original);
    }
}
