use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    detect_auth_method, load_from_env_file, AuthEndpoints, AuthMethod, EnvFileStore, TokenManager,
    TokenSettings, DEFAULT_AUTH_URL, DEFAULT_OAUTH_URL,
};
use crate::http_client::{HttpSettings, DEFAULT_API_URL};
use crate::model::{AnaplanModel, MetadataKind};

/// Anaplan integration client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Workspace id
    #[arg(short = 'w', long, global = true, env = "ANAPLAN_WORKSPACE_ID")]
    pub workspace: Option<String>,

    /// Model id
    #[arg(short = 'm', long, global = true, env = "ANAPLAN_MODEL_ID")]
    pub model: Option<String>,

    /// Credential store (env-style file)
    #[arg(
        short = 'c',
        long,
        global = true,
        env = "ANAPLAN_CREDS_FILE",
        default_value = "creds.env"
    )]
    pub creds_file: String,

    /// Authentication method (basic, certificate, oauth); detected from the creds file if omitted
    #[arg(short = 'a', long, global = true, env = "ANAPLAN_AUTH_METHOD")]
    pub auth_method: Option<AuthMethod>,

    /// Token service base URL
    #[arg(long, global = true, env = "ANAPLAN_AUTH_URL", default_value = DEFAULT_AUTH_URL)]
    pub auth_url: String,

    /// Integration API base URL
    #[arg(long, global = true, env = "ANAPLAN_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// OAuth service base URL
    #[arg(long, global = true, env = "ANAPLAN_OAUTH_URL", default_value = DEFAULT_OAUTH_URL)]
    pub oauth_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, global = true, env = "HTTP_REQUEST_TIMEOUT", default_value = "120")]
    pub http_timeout: u64,

    /// HTTP max retries (metadata reads only)
    #[arg(long, global = true, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    /// Renew tokens this many seconds before they expire
    #[arg(long, global = true, env = "TOKEN_REFRESH_MARGIN", default_value = "300")]
    pub refresh_margin: u64,

    /// Upload chunk size in MiB
    #[arg(long, global = true, env = "UPLOAD_CHUNK_MIB", default_value = "50")]
    pub chunk_size_mib: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Interactive credential setup
    Setup,

    /// List imports, exports, actions, processes, files, line-items or views
    List { kind: MetadataKind },

    /// Start an import/export/action/process
    Run {
        action_id: String,

        /// Poll the task until it finishes
        #[arg(long)]
        wait: bool,

        /// Seconds between polls
        #[arg(long, default_value = "2")]
        interval: u64,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// State of the latest task of an action
    Status { action_id: String },

    /// Full detail of the latest task of an action
    Monitor { action_id: String },

    /// Read the data of a view
    ReadView { view_id: String },

    /// Write cells from a JSON file into a module
    WriteCells { module_id: String, file: PathBuf },

    /// Upload a local file into a model file
    Upload { file_id: String, path: PathBuf },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Target model
    pub workspace_id: Option<String>,
    pub model_id: Option<String>,

    // Authentication
    pub creds_file: PathBuf,
    pub auth_method: Option<AuthMethod>,
    pub endpoints: AuthEndpoints,
    pub token: TokenSettings,

    // HTTP client
    pub api_url: String,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Uploads
    pub chunk_size: u64,

    pub log_level: String,
}

impl Config {
    /// Build configuration from parsed arguments (CLI > ENV > defaults)
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        if args.chunk_size_mib == 0 {
            anyhow::bail!("UPLOAD_CHUNK_MIB must be at least 1");
        }

        let refresh_margin = i64::try_from(args.refresh_margin)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .with_context(|| {
                format!("TOKEN_REFRESH_MARGIN ({}s) is out of range", args.refresh_margin)
            })?;
        let token = TokenSettings {
            refresh_margin,
            ..TokenSettings::default()
        };
        if token.refresh_margin >= token.lifetime {
            anyhow::bail!(
                "TOKEN_REFRESH_MARGIN ({}s) must be shorter than the token lifetime ({}s)",
                args.refresh_margin,
                token.lifetime.num_seconds()
            );
        }

        Ok(Config {
            workspace_id: args.workspace.clone(),
            model_id: args.model.clone(),

            creds_file: expand_tilde(&args.creds_file),
            auth_method: args.auth_method,
            endpoints: AuthEndpoints {
                auth_url: args.auth_url.clone(),
                oauth_url: args.oauth_url.clone(),
            },
            token,

            api_url: args.api_url.clone(),
            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            chunk_size: args.chunk_size_mib * 1024 * 1024,

            log_level: args.log_level.clone(),
        })
    }

    /// HTTP settings for the configured model; workspace and model are required
    pub fn require_model(&self) -> Result<HttpSettings> {
        let workspace_id = self
            .workspace_id
            .clone()
            .context("workspace id is required (use -w or set ANAPLAN_WORKSPACE_ID)")?;
        let model_id = self
            .model_id
            .clone()
            .context("model id is required (use -m or set ANAPLAN_MODEL_ID)")?;

        Ok(HttpSettings {
            api_url: self.api_url.clone(),
            workspace_id,
            model_id,
            connect_timeout: Duration::from_secs(self.http_connect_timeout),
            request_timeout: Duration::from_secs(self.http_request_timeout),
            max_retries: self.http_max_retries,
        })
    }

    pub fn store(&self) -> Arc<EnvFileStore> {
        Arc::new(EnvFileStore::new(self.creds_file.clone()))
    }

    /// Load the credential from the store and wrap it in a token manager
    pub fn token_manager(&self) -> Result<Arc<TokenManager>> {
        if !self.creds_file.exists() {
            anyhow::bail!(
                "Credential store does not exist: {}\n\nRun the setup wizard first:\n  anaplan-sync setup",
                self.creds_file.display()
            );
        }

        let store = self.store();
        let method = match self.auth_method {
            Some(method) => method,
            None => detect_auth_method(&store).context("Failed to detect authentication method")?,
        };
        tracing::debug!(method = ?method, creds_file = %self.creds_file.display(), "Loading credential");

        let credential = load_from_env_file(method, store).context("Failed to load credential")?;
        let manager = TokenManager::new(credential, self.endpoints.clone(), self.token)?;
        Ok(Arc::new(manager))
    }

    /// Connect to the configured model
    pub fn model(&self) -> Result<AnaplanModel> {
        let settings = self.require_model()?;
        let manager = self.token_manager()?;
        Ok(AnaplanModel::new(manager, &settings, self.chunk_size)?)
    }
}

/// Expand tilde (~) in file paths to user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let mut argv = vec!["anaplan-sync"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/creds.env");
        assert!(path.to_string_lossy().contains("test/creds.env"));
        assert!(!path.to_string_lossy().starts_with('~'));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
        assert_eq!(expand_tilde("relative/path"), PathBuf::from("relative/path"));
    }

    #[test]
    fn test_run_subcommand() {
        let args = parse(&["-w", "ws1", "-m", "m1", "run", "118000000000", "--wait", "--interval", "5"]);
        assert_eq!(
            args.command,
            Command::Run {
                action_id: "118000000000".to_string(),
                wait: true,
                interval: 5,
                timeout: 3600,
            }
        );
        assert_eq!(args.workspace.as_deref(), Some("ws1"));
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let args = parse(&["status", "112000000001", "--model", "m2", "--auth-method", "cert"]);
        assert_eq!(args.model.as_deref(), Some("m2"));
        assert_eq!(args.auth_method, Some(AuthMethod::Certificate));
    }

    #[test]
    fn test_list_kind_parse() {
        let args = parse(&["list", "line-items"]);
        assert_eq!(
            args.command,
            Command::List {
                kind: MetadataKind::LineItems
            }
        );

        let argv = ["anaplan-sync", "list", "modules"];
        assert!(CliArgs::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_config_from_args() {
        let args = parse(&["--chunk-size-mib", "10", "--refresh-margin", "120", "setup"]);
        let config = Config::from_args(&args).unwrap();

        assert_eq!(config.chunk_size, 10 * 1024 * 1024);
        assert_eq!(config.token.refresh_margin, chrono::Duration::seconds(120));
        assert_eq!(config.token.lifetime, chrono::Duration::minutes(35));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let args = parse(&["--chunk-size-mib", "0", "setup"]);
        assert!(Config::from_args(&args).is_err());

        let args = parse(&["--refresh-margin", "2100", "setup"]);
        assert!(Config::from_args(&args).is_err());

        for huge in [u64::MAX.to_string(), (i64::MAX as u64).to_string()] {
            let args = parse(&["--refresh-margin", huge.as_str(), "setup"]);
            let err = Config::from_args(&args).unwrap_err();
            assert!(err.to_string().contains("TOKEN_REFRESH_MARGIN"), "{}", err);
        }
    }

    #[test]
    fn test_require_model() {
        let args = parse(&["-w", "ws1", "setup"]);
        let config = Config::from_args(&args).unwrap();
        assert!(config.require_model().is_err());

        let args = parse(&["-w", "ws1", "-m", "m1", "--http-timeout", "30", "setup"]);
        let settings = Config::from_args(&args).unwrap().require_model().unwrap();
        assert_eq!(settings.workspace_id, "ws1");
        assert_eq!(settings.model_id, "m1");
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_creds_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("creds.env");
        let args = parse(&["-c", missing.to_str().unwrap(), "setup"]);
        let config = Config::from_args(&args).unwrap();

        match config.token_manager() {
            Err(err) => assert!(err.to_string().contains("does not exist")),
            Ok(manager) => panic!("expected a missing-file error, got {:?}", manager),
        }
    }

    #[test]
    fn test_token_manager_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.env");
        std::fs::write(&path, "un='user@example.com'\npw='secret'\n").unwrap();

        let args = parse(&["-c", path.to_str().unwrap(), "setup"]);
        let manager = Config::from_args(&args).unwrap().token_manager().unwrap();
        assert_eq!(manager.credential().method(), AuthMethod::Basic);
    }
}
