// Credential loading from the env-style credential store

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha512;
use std::path::Path;
use std::sync::Arc;

use super::store::{
    EnvFileStore, SecretStore, CERTIFICATE_KEY, CLIENT_ID_KEY, PASSWORD_KEY, PRIVATE_KEY_KEY,
    REFRESH_TOKEN_KEY, USERNAME_KEY,
};
use super::types::{AuthMethod, CertificateAuthRequest, Credential};
use crate::error::{ClientError, Result};

/// Size of the random payload signed during certificate authentication
pub const NONCE_LEN: usize = 100;

/// Load credentials for `method` from the credential store
pub fn load_from_env_file(method: AuthMethod, store: Arc<EnvFileStore>) -> Result<Credential> {
    tracing::info!(
        "Loading {:?} credentials from {}",
        method,
        store.path().display()
    );

    match method {
        AuthMethod::Basic => Ok(Credential::Basic {
            username: required(store.as_ref(), USERNAME_KEY)?,
            password: required(store.as_ref(), PASSWORD_KEY)?,
        }),
        AuthMethod::Certificate => {
            let cert_path = required(store.as_ref(), CERTIFICATE_KEY)?;
            let key_path = required(store.as_ref(), PRIVATE_KEY_KEY)?;
            certificate_from_files(Path::new(&cert_path), Path::new(&key_path))
        }
        AuthMethod::OAuth => {
            let client_id = required(store.as_ref(), CLIENT_ID_KEY)?;
            // Fail early rather than on the first exchange
            required(store.as_ref(), REFRESH_TOKEN_KEY)?;
            Ok(Credential::RotatingRefreshSecret {
                client_id,
                store: store as Arc<dyn SecretStore>,
            })
        }
    }
}

/// Detect authentication method based on which keys the store holds
pub fn detect_auth_method(store: &EnvFileStore) -> Result<AuthMethod> {
    let entries = store.entries()?;
    let has = |key: &str| entries.get(key).map(|v| !v.is_empty()).unwrap_or(false);

    if has(REFRESH_TOKEN_KEY) && has(CLIENT_ID_KEY) {
        tracing::info!("Detected auth method: OAuth refresh token");
        Ok(AuthMethod::OAuth)
    } else if has(CERTIFICATE_KEY) && has(PRIVATE_KEY_KEY) {
        tracing::info!("Detected auth method: certificate");
        Ok(AuthMethod::Certificate)
    } else if has(USERNAME_KEY) && has(PASSWORD_KEY) {
        tracing::info!("Detected auth method: basic");
        Ok(AuthMethod::Basic)
    } else {
        Err(ClientError::Config(format!(
            "no usable credentials in {} (run `anaplan-sync setup`)",
            store.path().display()
        )))
    }
}

/// Read a certificate/private key pair from PEM files
pub fn certificate_from_files(cert_path: &Path, key_path: &Path) -> Result<Credential> {
    let certificate_pem = std::fs::read_to_string(cert_path).map_err(|e| {
        ClientError::Config(format!(
            "cannot read certificate {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    let private_key_pem = std::fs::read_to_string(key_path).map_err(|e| {
        ClientError::Config(format!(
            "cannot read private key {}: {}",
            key_path.display(),
            e
        ))
    })?;

    Ok(Credential::Certificate {
        certificate_pem,
        private_key_pem,
    })
}

/// Strip PEM armour and line breaks from a certificate
pub fn canonicalize_certificate(pem: &str) -> String {
    pem.replace("-----BEGIN CERTIFICATE-----", "")
        .replace("-----END CERTIFICATE-----", "")
        .replace(['\r', '\n'], "")
        .trim()
        .to_string()
}

/// Parse an RSA private key in PKCS#8 or PKCS#1 PEM form
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| ClientError::Authentication(format!("unreadable private key: {}", e)))
}

/// Sign `nonce` with RSA PKCS#1 v1.5 over SHA-512
pub fn sign_nonce(private_key: &RsaPrivateKey, nonce: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha512>::new(private_key.clone());
    signing_key.sign(nonce).to_vec()
}

/// Build the certificate authentication body over a fresh random nonce
pub fn certificate_auth_body(private_key_pem: &str) -> Result<CertificateAuthRequest> {
    let private_key = parse_private_key(private_key_pem)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let signature = sign_nonce(&private_key, &nonce);

    Ok(CertificateAuthRequest {
        encoded_data: BASE64.encode(nonce),
        encoded_signed_data: BASE64.encode(signature),
    })
}

fn required(store: &dyn SecretStore, key: &str) -> Result<String> {
    store
        .get(key)?
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ClientError::Config(format!("credential store is missing `{}`", key)))
}
