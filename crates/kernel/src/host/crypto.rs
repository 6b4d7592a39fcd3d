//! AES-CBC encryption helpers and the text encodings that go with them.
//!
//! Key material of length 16, 24, or 32 selects the cipher width
//! directly; any other length is hashed to 32 bytes with SHA-256. When
//! no IV is supplied a random one is generated and prepended to the
//! ciphertext, and decryption without an IV expects that layout.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{HostError, HostResult};

const IV_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

enum KeyMaterial {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

fn normalize_key(key: &[u8]) -> KeyMaterial {
    match key.len() {
        16 => {
            let mut k = [0u8; 16];
            k.copy_from_slice(key);
            KeyMaterial::Aes128(k)
        }
        24 => {
            let mut k = [0u8; 24];
            k.copy_from_slice(key);
            KeyMaterial::Aes192(k)
        }
        32 => {
            let mut k = [0u8; 32];
            k.copy_from_slice(key);
            KeyMaterial::Aes256(k)
        }
        _ => KeyMaterial::Aes256(Sha256::digest(key).into()),
    }
}

/// Encrypt with AES-CBC and PKCS7 padding.
///
/// With an explicit IV the result is the bare ciphertext; without one a
/// random IV is generated and prepended.
pub fn encrypt(key: &[u8], plaintext: &[u8], iv: Option<&[u8]>) -> HostResult<Vec<u8>> {
    let key = normalize_key(key);
    match iv {
        Some(iv) => {
            let iv = check_iv(iv)?;
            Ok(cbc_encrypt(&key, &iv, plaintext))
        }
        None => {
            let mut iv = [0u8; IV_LEN];
            rand::thread_rng().fill_bytes(&mut iv);
            let ciphertext = cbc_encrypt(&key, &iv, plaintext);
            let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
    }
}

/// Decrypt AES-CBC with PKCS7 padding.
///
/// With an explicit IV, `data` is the bare ciphertext; without one the
/// first 16 bytes of `data` are taken as the IV.
pub fn decrypt(key: &[u8], data: &[u8], iv: Option<&[u8]>) -> HostResult<Vec<u8>> {
    let key = normalize_key(key);
    let (iv, ciphertext) = match iv {
        Some(iv) => (check_iv(iv)?, data),
        None => {
            if data.len() < IV_LEN {
                return Err(HostError::invalid_argument(
                    "ciphertext too short to contain an IV",
                ));
            }
            let (head, tail) = data.split_at(IV_LEN);
            (check_iv(head)?, tail)
        }
    };
    cbc_decrypt(&key, &iv, ciphertext)
}

fn check_iv(iv: &[u8]) -> HostResult<[u8; IV_LEN]> {
    if iv.len() != IV_LEN {
        return Err(HostError::invalid_argument(format!(
            "IV must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    let mut out = [0u8; IV_LEN];
    out.copy_from_slice(iv);
    Ok(out)
}

fn cbc_encrypt(key: &KeyMaterial, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    match key {
        KeyMaterial::Aes128(k) => {
            Aes128CbcEnc::new(k.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }
        KeyMaterial::Aes192(k) => {
            Aes192CbcEnc::new(k.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }
        KeyMaterial::Aes256(k) => {
            Aes256CbcEnc::new(k.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }
    }
}

fn cbc_decrypt(key: &KeyMaterial, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> HostResult<Vec<u8>> {
    let result = match key {
        KeyMaterial::Aes128(k) => {
            Aes128CbcDec::new(k.into(), iv.into()).decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        }
        KeyMaterial::Aes192(k) => {
            Aes192CbcDec::new(k.into(), iv.into()).decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        }
        KeyMaterial::Aes256(k) => {
            Aes256CbcDec::new(k.into(), iv.into()).decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        }
    };
    result.map_err(|_| HostError::invalid_argument("decryption failed: bad key, IV, or padding"))
}

/// Text encodings for turning strings into key/ciphertext bytes and
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Base64,
    Hex,
    Latin1,
    /// UTF-16 big-endian.
    Utf16,
    Utf16Le,
}

impl Encoding {
    pub fn parse(name: &str) -> HostResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "base64" => Ok(Self::Base64),
            "hex" => Ok(Self::Hex),
            "latin1" => Ok(Self::Latin1),
            "utf16" | "utf-16" => Ok(Self::Utf16),
            "utf16le" | "utf-16le" => Ok(Self::Utf16Le),
            other => Err(HostError::invalid_argument(format!(
                "unknown encoding: {other}"
            ))),
        }
    }

    /// Bytes represented by `text` in this encoding.
    pub fn decode(&self, text: &str) -> HostResult<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Base64 => BASE64
                .decode(text)
                .map_err(|error| HostError::invalid_argument(format!("invalid base64: {error}"))),
            Self::Hex => hex::decode(text)
                .map_err(|error| HostError::invalid_argument(format!("invalid hex: {error}"))),
            Self::Latin1 => text
                .chars()
                .map(|c| {
                    let code = c as u32;
                    if code <= 0xFF {
                        Ok(code as u8)
                    } else {
                        Err(HostError::invalid_argument(format!(
                            "character {c:?} is outside latin1"
                        )))
                    }
                })
                .collect(),
            Self::Utf16 => Ok(text
                .encode_utf16()
                .flat_map(|unit| unit.to_be_bytes())
                .collect()),
            Self::Utf16Le => Ok(text
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect()),
        }
    }

    /// Render `bytes` as text in this encoding. Lossy where the bytes
    /// are not valid for the encoding.
    pub fn encode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Base64 => BASE64.encode(bytes),
            Self::Hex => hex::encode(bytes),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Self::Utf16 => {
                let units: Vec<u16> = bytes
                    .chunks(2)
                    .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
            Self::Utf16Le => {
                let units: Vec<u16> = bytes
                    .chunks(2)
                    .map(|pair| u16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }
}
