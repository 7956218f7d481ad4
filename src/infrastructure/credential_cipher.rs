//! Credential Cipher
//!
//! The tenant-facing app stores exchange API keys encrypted with a shared
//! passphrase, in the OpenSSL passphrase format: base64 of `Salted__`, an
//! 8-byte salt and AES-256-CBC ciphertext. Key and IV come from one-round MD5
//! `EVP_BytesToKey` over the passphrase and salt.

use crate::domain::entities::tenant::ApiCredentials;
use crate::domain::errors::ExchangeError;
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use md5::{Digest, Md5};
use zeroize::Zeroizing;

const SALT_HEADER: &[u8] = b"Salted__";
const SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub struct CredentialCipher {
    passphrase: Zeroizing<String>,
}

impl CredentialCipher {
    pub fn new(passphrase: Zeroizing<String>) -> Self {
        Self { passphrase }
    }

    /// Decrypt one stored value.
    pub fn decrypt(&self, encrypted: &str) -> Result<Zeroizing<String>, ExchangeError> {
        let raw = Zeroizing::new(
            STANDARD
                .decode(encrypted.trim())
                .map_err(|_| undecryptable("not base64"))?,
        );
        if raw.len() < SALT_HEADER.len() + SALT_LEN + BLOCK_LEN || !raw.starts_with(SALT_HEADER) {
            return Err(undecryptable("missing salt header"));
        }
        let (salt, ciphertext) = raw[SALT_HEADER.len()..].split_at(SALT_LEN);

        let (key, iv) = derive_key_iv(self.passphrase.as_bytes(), salt);
        let decryptor = Aes256CbcDec::new_from_slices(&key[..], &iv[..])
            .map_err(|_| undecryptable("bad key length"))?;
        let plain = Zeroizing::new(
            decryptor
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| undecryptable("wrong passphrase or corrupted value"))?,
        );

        let text = std::str::from_utf8(&plain).map_err(|_| undecryptable("not UTF-8"))?;
        if text.trim().is_empty() {
            return Err(undecryptable("empty value"));
        }
        Ok(Zeroizing::new(text.to_string()))
    }

    pub fn decrypt_credentials(
        &self,
        credentials: &ApiCredentials,
    ) -> Result<ApiCredentials, ExchangeError> {
        let api_key = self.decrypt(&credentials.api_key)?;
        let secret_key = self.decrypt(&credentials.secret_key)?;
        Ok(ApiCredentials::new(&api_key, &secret_key))
    }
}

fn undecryptable(reason: &str) -> ExchangeError {
    ExchangeError::Authentication(format!("Stored credentials could not be decrypted: {}", reason))
}

/// `EVP_BytesToKey` with MD5 and a single iteration.
fn derive_key_iv(
    passphrase: &[u8],
    salt: &[u8],
) -> (Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; IV_LEN]>) {
    let mut material = Zeroizing::new(Vec::with_capacity(KEY_LEN + IV_LEN + 16));
    let mut block = Zeroizing::new(Vec::new());
    while material.len() < KEY_LEN + IV_LEN {
        let mut hasher = Md5::new();
        hasher.update(&block[..]);
        hasher.update(passphrase);
        hasher.update(salt);
        *block = hasher.finalize().to_vec();
        material.extend_from_slice(&block);
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&material[..KEY_LEN]);
    let mut iv = Zeroizing::new([0u8; IV_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + IV_LEN]);
    (key, iv)
}
