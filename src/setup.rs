// Interactive credential setup
// Prompts for credentials, proves them by obtaining a token, then saves them

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Password, Select};
use std::path::PathBuf;
use std::sync::Arc;

use anaplan_sync::auth::device::{poll_device_token, request_device_code};
use anaplan_sync::auth::store::{CERTIFICATE_KEY, PASSWORD_KEY, PRIVATE_KEY_KEY, USERNAME_KEY};
use anaplan_sync::auth::{
    certificate_from_files, AuthMethod, Credential, EnvFileStore, SecretStore, TokenManager,
    AUTH_TIMEOUT,
};
use anaplan_sync::config::{expand_tilde, Config};

/// Run the wizard until credentials are proven and saved, or the user gives up
pub async fn run_interactive_setup(config: &Config) -> Result<()> {
    println!();
    println!("Anaplan Sync - Credential Setup");
    println!("===============================");
    println!();
    println!("Credentials will be saved to {}", config.creds_file.display());
    println!();

    let methods = ["Basic (username and password)", "Certificate", "OAuth device"];
    let choice = Select::new()
        .with_prompt("Select authentication method")
        .items(&methods)
        .default(0)
        .interact()
        .context("Failed to read authentication method")?;
    let method = match choice {
        0 => AuthMethod::Basic,
        1 => AuthMethod::Certificate,
        _ => AuthMethod::OAuth,
    };

    let store = config.store();

    loop {
        let attempt = match method {
            AuthMethod::Basic => setup_basic(config, &store).await,
            AuthMethod::Certificate => setup_certificate(config, &store).await,
            AuthMethod::OAuth => setup_oauth(config, &store).await,
        };

        match attempt {
            Ok(()) => break,
            Err(e) => {
                tracing::error!("Setup attempt failed: {:#}", e);
                println!();
                println!("Authentication failed: {:#}", e);
                let retry = Confirm::new()
                    .with_prompt("Try again?")
                    .default(true)
                    .interact()
                    .context("Failed to read confirmation")?;
                if !retry {
                    anyhow::bail!("Setup aborted, no credentials saved");
                }
            }
        }
    }

    println!();
    println!("Setup complete. Credentials saved to {}", config.creds_file.display());
    println!();
    Ok(())
}

/// Obtain one token with `credential`; nothing is saved on failure
async fn prove(config: &Config, credential: Credential) -> Result<()> {
    let manager = TokenManager::new(credential, config.endpoints.clone(), config.token)?;
    let token = manager.current_token().await?;
    tracing::info!(expires_at = %token.expires_at(), "Credentials verified");
    Ok(())
}

async fn setup_basic(config: &Config, store: &Arc<EnvFileStore>) -> Result<()> {
    let username: String = Input::new()
        .with_prompt("Anaplan username (email)")
        .interact_text()
        .context("Failed to read username")?;
    let password = Password::new()
        .with_prompt("Anaplan password")
        .interact()
        .context("Failed to read password")?;

    if username.trim().is_empty() || password.is_empty() {
        anyhow::bail!("username and password cannot be empty");
    }

    prove(config, Credential::basic(username.trim(), password.as_str())).await?;

    store.set(USERNAME_KEY, username.trim())?;
    store.set(PASSWORD_KEY, &password)?;
    Ok(())
}

async fn setup_certificate(config: &Config, store: &Arc<EnvFileStore>) -> Result<()> {
    let cert: String = Input::new()
        .with_prompt("Path to the CA certificate (PEM)")
        .interact_text()
        .context("Failed to read certificate path")?;
    let key: String = Input::new()
        .with_prompt("Path to the private key (PEM)")
        .interact_text()
        .context("Failed to read private key path")?;

    let cert_path = absolute(&cert)?;
    let key_path = absolute(&key)?;

    let credential = certificate_from_files(&cert_path, &key_path)?;
    prove(config, credential).await?;

    store.set(CERTIFICATE_KEY, &cert_path.to_string_lossy())?;
    store.set(PRIVATE_KEY_KEY, &key_path.to_string_lossy())?;
    Ok(())
}

async fn setup_oauth(config: &Config, store: &Arc<EnvFileStore>) -> Result<()> {
    let client_id: String = Input::new()
        .with_prompt("OAuth client id")
        .interact_text()
        .context("Failed to read client id")?;
    let client_id = client_id.trim().to_string();
    if client_id.is_empty() {
        anyhow::bail!("client id cannot be empty");
    }

    let client = reqwest::Client::builder()
        .timeout(AUTH_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")?;

    let code = request_device_code(&client, &config.endpoints, &client_id).await?;

    println!();
    println!("Open {} in a browser", code.verification_uri);
    println!("and enter the code: {}", code.user_code);
    if let Some(complete) = &code.verification_uri_complete {
        println!("(or open {} directly)", complete);
    }
    println!();
    println!("Waiting for approval...");

    poll_device_token(
        &client,
        &config.endpoints,
        &client_id,
        &code,
        store.as_ref() as &dyn SecretStore,
    )
    .await?;

    // Proving rotates the refresh token; the new one is persisted by the manager
    prove(
        config,
        Credential::RotatingRefreshSecret {
            client_id,
            store: store.clone() as Arc<dyn SecretStore>,
        },
    )
    .await
}

/// Resolve a user-supplied path so the store stays valid from any directory
fn absolute(path: &str) -> Result<PathBuf> {
    let path = expand_tilde(path.trim());
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}
