use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

const TOKEN_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault token has a bad format")]
    BadFormat,
    #[error("vault key must be exactly 32 bytes")]
    BadKey,
    #[error("vault token failed authentication")]
    BadTag,
}

/// AEAD vault for device auth-state blobs. The key is symmetric and
/// process-wide: every worker sharing the store must decrypt every blob, and
/// blobs must survive restarts. Tokens are self-describing:
/// `v1:<iv_b64>:<tag_b64>:<ct_b64>`.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != 32 {
            return Err(VaultError::BadKey);
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let nonce_bytes = rand::random::<[u8; NONCE_LEN]>();
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the 16-byte tag to the ciphertext; the token keeps
        // the tag as its own field.
        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::BadKey)?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}:{}",
            TOKEN_VERSION,
            B64.encode(nonce_bytes),
            B64.encode(tag),
            B64.encode(sealed)
        ))
    }

    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, VaultError> {
        let mut parts = token.splitn(4, ':');
        let version = parts.next().ok_or(VaultError::BadFormat)?;
        if version != TOKEN_VERSION {
            return Err(VaultError::BadFormat);
        }

        let iv = decode_field(parts.next())?;
        let tag = decode_field(parts.next())?;
        let ciphertext = decode_field(parts.next())?;

        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(VaultError::BadFormat);
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        self.cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| VaultError::BadTag)
    }
}

fn decode_field(field: Option<&str>) -> Result<Vec<u8>, VaultError> {
    let field = field.ok_or(VaultError::BadFormat)?;
    B64.decode(field).map_err(|_| VaultError::BadFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn rejects_short_key() {
        assert!(matches!(Vault::new(&[0u8; 16]), Err(VaultError::BadKey)));
    }

    #[test]
    fn round_trips() {
        let v = vault();
        let token = v.encrypt(b"creds-and-keys").unwrap();
        assert!(token.starts_with("v1:"));
        assert_eq!(v.decrypt(&token).unwrap(), b"creds-and-keys");
    }

    #[test]
    fn token_has_four_base64_fields() {
        let token = vault().encrypt(b"x").unwrap();
        let parts: Vec<&str> = token.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(B64.decode(parts[1]).unwrap().len(), NONCE_LEN);
        assert_eq!(B64.decode(parts[2]).unwrap().len(), TAG_LEN);
    }

    #[test]
    fn detects_tampering_in_every_field() {
        let v = vault();
        let token = v.encrypt(b"secret state").unwrap();
        let parts: Vec<String> = token.split(':').map(String::from).collect();

        for field in 1..4 {
            let mut raw = B64.decode(&parts[field]).unwrap();
            raw[0] ^= 0x01;
            let mut tampered = parts.clone();
            tampered[field] = B64.encode(&raw);
            let result = v.decrypt(&tampered.join(":"));
            assert!(
                matches!(result, Err(VaultError::BadTag)),
                "bit flip in field {} must fail authentication",
                field
            );
        }
    }

    #[test]
    fn rejects_malformed_tokens() {
        let v = vault();
        assert!(matches!(v.decrypt("v0:a:b:c"), Err(VaultError::BadFormat)));
        assert!(matches!(v.decrypt("v1:notb64!!:a:b"), Err(VaultError::BadFormat)));
        assert!(matches!(v.decrypt("v1:QUJD"), Err(VaultError::BadFormat)));
        assert!(matches!(v.decrypt(""), Err(VaultError::BadFormat)));
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let token = vault().encrypt(b"state").unwrap();
        let other = Vault::new(&[8u8; 32]).unwrap();
        assert!(matches!(other.decrypt(&token), Err(VaultError::BadTag)));
    }
}
