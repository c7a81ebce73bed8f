// Authentication module
// Manages token lifecycle, credential loading and the local credential store

mod credentials;
pub mod device;
mod exchange;
mod manager;
pub mod store;
mod types;

pub use credentials::{
    canonicalize_certificate, certificate_from_files, detect_auth_method, load_from_env_file,
};
pub use manager::{TokenManager, TokenSettings, AUTH_TIMEOUT};
pub use store::{EnvFileStore, MemoryStore, SecretStore};
pub use types::{
    AuthEndpoints, AuthMethod, Credential, Token, AUTH_SCHEME, DEFAULT_AUTH_URL, DEFAULT_OAUTH_URL,
};
