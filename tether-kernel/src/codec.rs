/**
 * PAYLOAD CODEC - Chiffrement AES-CBC des payloads échangés avec les devices
 *
 * RÔLE : Transformation pure, sans effet de bord.
 * FORMAT : base64( IV[16] || AES-128-CBC(PKCS7(plaintext)) ) sous une clé pré-partagée.
 *
 * PARTICULARITÉ : au déchiffrement, le padding n'est retiré que si le dernier octet
 * est dans [1,16]. Sinon les octets déchiffrés bruts sont rendus tels quels.
 */

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use rand::RngCore;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const BLOCK_SIZE: usize = 16;
pub const DEFAULT_KEY: &str = "ThisIsAFakeKey16";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("blob too short: {0} bytes, need IV plus at least one block")]
    TooShort(usize),
    #[error("ciphertext length {0} is not a multiple of the block size")]
    BlockSize(usize),
    #[error("plaintext is not valid UTF-8")]
    Utf8,
    #[error("key must be {BLOCK_SIZE} bytes, got {0}")]
    Key(usize),
}

#[derive(Clone)]
pub struct PayloadCodec {
    key: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec").finish_non_exhaustive()
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        let mut key = [0u8; BLOCK_SIZE];
        key.copy_from_slice(DEFAULT_KEY.as_bytes());
        Self { key }
    }
}

impl PayloadCodec {
    pub fn new(key: &[u8]) -> Result<Self, DecodeError> {
        let key: [u8; BLOCK_SIZE] = key.try_into().map_err(|_| DecodeError::Key(key.len()))?;
        Ok(Self { key })
    }

    /// Déchiffre un blob base64 `IV || ciphertext`
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, DecodeError> {
        // Les clients Android coupent le base64 en lignes de 76 caractères
        let compact: Vec<u8> = blob.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
        let raw = BASE64_STANDARD
            .decode(&compact)
            .map_err(|e| DecodeError::Base64(e.to_string()))?;

        if raw.len() < BLOCK_SIZE * 2 {
            return Err(DecodeError::TooShort(raw.len()));
        }
        let (iv, ciphertext) = raw.split_at(BLOCK_SIZE);
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(DecodeError::BlockSize(ciphertext.len()));
        }

        let mut plain = Aes128CbcDec::new_from_slices(&self.key, iv)
            .map_err(|_| DecodeError::Key(self.key.len()))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| DecodeError::BlockSize(ciphertext.len()))?;

        if let Some(&pad) = plain.last() {
            let pad = pad as usize;
            if (1..=BLOCK_SIZE).contains(&pad) {
                plain.truncate(plain.len() - pad);
            }
        }
        Ok(plain)
    }

    pub fn decrypt_str(&self, blob: &str) -> Result<String, DecodeError> {
        let plain = self.decrypt(blob.as_bytes())?;
        String::from_utf8(plain).map_err(|_| DecodeError::Utf8)
    }

    /// Chiffre avec un IV aléatoire neuf à chaque appel
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext =
            Aes128CbcEnc::new(&self.key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut framed = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        BASE64_STANDARD.encode(framed)
    }
}
