use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Microsoft identity platform authority used when BASE_URL is not set
pub const DEFAULT_BASE_URL: &str = "https://login.microsoftonline.com/consumers";

/// Mailbox REST API root used when GRAPH_API_BASE is not set
pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Variables that must be present (and non-empty) at startup
pub const REQUIRED_VARS: [&str; 7] = [
    "CLIENT_ID",
    "CLIENT_SECRET",
    "REDIRECT_URI",
    "SCOPE",
    "TENANT_ID",
    "REFRESH_TOKEN",
    "ACCESS_TOKEN",
];

/// Value written for the token pair before the first login
pub const PENDING_TOKEN: &str = "pending-login";

/// Outlook OAuth client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the .env file
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides LOG_LEVEL
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the browser authorization-code flow and store the token pair
    Login,

    /// Validate the stored token against the mailbox API, refreshing on 401
    Check {
        /// Refresh the token before probing
        #[arg(long)]
        force_refresh: bool,
    },

    /// Refresh the access token unconditionally
    Refresh,

    /// List unread messages in a folder
    Unread {
        #[arg(long, default_value = "inbox")]
        folder: String,
    },

    /// List mail folders
    Folders,

    /// List master categories
    Categories,

    /// Mark messages as unread
    MarkUnread {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Download matching attachments of unread messages and mark them read
    Sweep {
        #[arg(long, default_value = "inbox")]
        folder: String,

        /// Directory the attachments are written to
        #[arg(long, default_value = ".")]
        dest: PathBuf,

        /// Attachment file extension to collect
        #[arg(long, default_value = "csv")]
        extension: String,
    },

    /// Rewrite the .env file from a persisted token file
    ApplyTokenFile {
        #[arg(long)]
        token_file: Option<PathBuf>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    // Client identity
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub redirect_uri: String,
    pub scope: String,

    // Initial token material
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,

    // Endpoints
    pub base_url: String,
    pub token_url: String,
    pub graph_api_base: String,

    // Persistence
    pub add_token_response_to_file: bool,
    pub token_file: PathBuf,
    pub token_archive_dir: PathBuf,
    pub env_archive_dir: PathBuf,
    pub token_response_file: PathBuf,

    // Local callback listener
    pub callback_host: String,
    pub callback_port: u16,

    // HTTP client
    pub http_request_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Load configuration from the .env file and the process environment
    pub fn load(env_file: &Path) -> Result<Self> {
        match dotenvy::from_path(env_file) {
            Ok(()) => tracing::debug!("Loaded environment from {}", env_file.display()),
            Err(e) if e.not_found() => {
                tracing::debug!("No env file at {}", env_file.display())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", env_file.display()))
            }
        }

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Build configuration from a variable lookup function
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::MissingVar(key));

        // Validate every required variable before reading optional ones
        for var in REQUIRED_VARS {
            required(var)?;
        }

        let base_url = get("BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let token_url = get("TOKEN_URL").unwrap_or_else(|| format!("{}/oauth2/v2.0/token", base_url));

        let expires_in = match get("EXPIRES_IN") {
            Some(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid {
                var: "EXPIRES_IN",
                value: raw.clone(),
            })?),
            None => None,
        };

        // The listener address defaults to where the provider redirects the browser
        let redirect_uri = required("REDIRECT_URI")?;
        let redirect = reqwest::Url::parse(&redirect_uri).map_err(|_| ConfigError::Invalid {
            var: "REDIRECT_URI",
            value: redirect_uri.clone(),
        })?;
        let redirect_port = redirect.port_or_known_default();

        let callback_host = get("CALLBACK_HOST")
            .or_else(|| redirect.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        let callback_port = match get("CALLBACK_PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "CALLBACK_PORT",
                value: raw.clone(),
            })?,
            None => redirect_port.unwrap_or(8000),
        };
        if redirect_port != Some(callback_port) {
            tracing::warn!(
                "CALLBACK_PORT {} does not match the port of REDIRECT_URI {}, the redirect will not reach the listener",
                callback_port,
                redirect_uri
            );
        }

        let http_request_timeout = match get("HTTP_REQUEST_TIMEOUT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "HTTP_REQUEST_TIMEOUT",
                value: raw.clone(),
            })?,
            None => 60,
        };

        Ok(Config {
            client_id: required("CLIENT_ID")?,
            client_secret: required("CLIENT_SECRET")?,
            tenant_id: required("TENANT_ID")?,
            redirect_uri,
            scope: required("SCOPE")?,

            access_token: required("ACCESS_TOKEN")?,
            refresh_token: required("REFRESH_TOKEN")?,
            token_type: get("TOKEN_TYPE"),
            expires_in,

            base_url,
            token_url,
            graph_api_base: get("GRAPH_API_BASE")
                .unwrap_or_else(|| DEFAULT_GRAPH_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),

            add_token_response_to_file: parse_bool_flag(get("ADD_TOKEN_RESPONSE_TO_FILE").as_deref()),
            token_file: expand_tilde(&get("TOKEN_FILE").unwrap_or_else(|| "token_details.json".to_string())),
            token_archive_dir: expand_tilde(&get("TOKEN_ARCHIVE_DIR").unwrap_or_else(|| "old_tokens".to_string())),
            env_archive_dir: expand_tilde(&get("ENV_ARCHIVE_DIR").unwrap_or_else(|| "old_envs".to_string())),
            token_response_file: expand_tilde(
                &get("TOKEN_RESPONSE_FILE").unwrap_or_else(|| "token_response.json".to_string()),
            ),

            callback_host,
            callback_port,

            http_request_timeout,

            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Provider authorization endpoint
    pub fn authorize_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.base_url)
    }

    /// Address the local callback listener binds to
    pub fn callback_addr(&self) -> String {
        format!("{}:{}", self.callback_host, self.callback_port)
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse a boolean string flag; only "true" (any case) enables it
fn parse_bool_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Contents of a generated .env file
#[derive(Debug, Clone, PartialEq)]
pub struct EnvFile {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub scope: String,
    pub redirect_uri: String,
    pub refresh_token: String,
    pub access_token: String,
    pub base_url: String,
    pub add_token_response_to_file: bool,
}

impl EnvFile {
    /// Render as KEY=value lines
    pub fn render(&self) -> String {
        format!(
            "CLIENT_ID={}\n\
             CLIENT_SECRET={}\n\
             TENANT_ID={}\n\
             SCOPE={}\n\
             REFRESH_TOKEN={}\n\
             ACCESS_TOKEN={}\n\
             BASE_URL={}\n\
             REDIRECT_URI={}\n\
             ADD_TOKEN_RESPONSE_TO_FILE={}\n",
            self.client_id,
            self.client_secret,
            self.tenant_id,
            self.scope,
            self.refresh_token,
            self.access_token,
            self.base_url,
            self.redirect_uri,
            if self.add_token_response_to_file {
                "True"
            } else {
                "False"
            },
        )
    }
}

// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and no client identity in the environment)
pub fn needs_interactive_setup(env_file: &Path) -> bool {
    !env_file.exists() && std::env::var("CLIENT_ID").is_err()
}

/// Prompt for the app registration and write a .env ready for `login`
pub fn run_interactive_setup(env_file: &Path) -> Result<()> {
    println!();
    println!("No configuration found. Enter the app registration details.");
    println!();

    let client_id: String = Input::new()
        .with_prompt("Application (client) ID (CLIENT_ID)")
        .interact_text()
        .context("Failed to read CLIENT_ID")?;

    let client_secret: String = Password::new()
        .with_prompt("Client secret (CLIENT_SECRET)")
        .interact()
        .context("Failed to read CLIENT_SECRET")?;

    if client_id.trim().is_empty() || client_secret.is_empty() {
        anyhow::bail!("CLIENT_ID and CLIENT_SECRET cannot be empty");
    }

    let tenant_id: String = Input::new()
        .with_prompt("Tenant (TENANT_ID)")
        .default("consumers".to_string())
        .interact_text()
        .context("Failed to read TENANT_ID")?;

    let redirect_uri: String = Input::new()
        .with_prompt("Redirect URI (REDIRECT_URI)")
        .default("http://localhost:8000/".to_string())
        .interact_text()
        .context("Failed to read REDIRECT_URI")?;

    let scope: String = Input::new()
        .with_prompt("Scopes (SCOPE)")
        .default("offline_access Mail.ReadWrite Mail.Send".to_string())
        .interact_text()
        .context("Failed to read SCOPE")?;

    let env = EnvFile {
        client_id: client_id.trim().to_string(),
        client_secret,
        tenant_id,
        scope,
        redirect_uri,
        refresh_token: PENDING_TOKEN.to_string(),
        access_token: PENDING_TOKEN.to_string(),
        base_url: DEFAULT_BASE_URL.to_string(),
        add_token_response_to_file: true,
    };

    let mut file = std::fs::File::create(env_file)
        .with_context(|| format!("Failed to create {}", env_file.display()))?;
    file.write_all(env.render().as_bytes())
        .with_context(|| format!("Failed to write {}", env_file.display()))?;

    println!();
    println!("Configuration saved to {}", env_file.display());
    println!("Run `outlook-oauth login` to authorize the application.");
    println!();

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("CLIENT_ID", "client-123".to_string()),
            ("CLIENT_SECRET", "secret-456".to_string()),
            ("REDIRECT_URI", "http://localhost:8000/".to_string()),
            ("SCOPE", "offline_access Mail.ReadWrite".to_string()),
            ("TENANT_ID", "consumers".to_string()),
            ("REFRESH_TOKEN", "refresh-abc".to_string()),
            ("ACCESS_TOKEN", "access-xyz".to_string()),
        ])
    }

    fn load(vars: &HashMap<&'static str, String>) -> std::result::Result<Config, ConfigError> {
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_applied() {
        let config = load(&base_vars()).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(
            config.token_url,
            "https://login.microsoftonline.com/consumers/oauth2/v2.0/token"
        );
        assert_eq!(
            config.authorize_url(),
            "https://login.microsoftonline.com/consumers/oauth2/v2.0/authorize"
        );
        assert_eq!(config.graph_api_base, DEFAULT_GRAPH_API_BASE);
        assert!(!config.add_token_response_to_file);
        assert_eq!(config.token_file, PathBuf::from("token_details.json"));
        assert_eq!(config.token_archive_dir, PathBuf::from("old_tokens"));
        assert_eq!(config.callback_addr(), "localhost:8000");
        assert_eq!(config.expires_in, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_each_required_var_is_fatal() {
        for var in REQUIRED_VARS {
            let mut vars = base_vars();
            vars.remove(var);
            match load(&vars) {
                Err(ConfigError::MissingVar(missing)) => assert_eq!(missing, var),
                other => panic!("expected MissingVar({}), got {:?}", var, other),
            }
        }
    }

    #[test]
    fn test_blank_required_var_is_missing() {
        let mut vars = base_vars();
        vars.insert("CLIENT_SECRET", "   ".to_string());
        assert!(matches!(
            load(&vars),
            Err(ConfigError::MissingVar("CLIENT_SECRET"))
        ));
    }

    #[test]
    fn test_token_url_follows_base_url() {
        let mut vars = base_vars();
        vars.insert("BASE_URL", "https://login.example.test/tenant-a/".to_string());
        let config = load(&vars).unwrap();
        assert_eq!(
            config.token_url,
            "https://login.example.test/tenant-a/oauth2/v2.0/token"
        );

        vars.insert("TOKEN_URL", "http://127.0.0.1:9999/token".to_string());
        let config = load(&vars).unwrap();
        assert_eq!(config.token_url, "http://127.0.0.1:9999/token");
    }

    #[test]
    fn test_add_token_response_flag() {
        let mut vars = base_vars();
        for (raw, expected) in [("true", true), ("True", true), ("TRUE", true), ("1", false), ("no", false)] {
            vars.insert("ADD_TOKEN_RESPONSE_TO_FILE", raw.to_string());
            assert_eq!(load(&vars).unwrap().add_token_response_to_file, expected, "{}", raw);
        }
    }

    #[test]
    fn test_invalid_expires_in() {
        let mut vars = base_vars();
        vars.insert("EXPIRES_IN", "soon".to_string());
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { var: "EXPIRES_IN", .. })
        ));

        vars.insert("EXPIRES_IN", "3599".to_string());
        assert_eq!(load(&vars).unwrap().expires_in, Some(3599));
    }

    #[test]
    fn test_invalid_http_request_timeout() {
        let mut vars = base_vars();
        vars.insert("HTTP_REQUEST_TIMEOUT", "1m".to_string());
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { var: "HTTP_REQUEST_TIMEOUT", .. })
        ));

        vars.insert("HTTP_REQUEST_TIMEOUT", "15".to_string());
        assert_eq!(load(&vars).unwrap().http_request_timeout, 15);
    }

    #[test]
    fn test_callback_addr_follows_redirect_uri() {
        let mut vars = base_vars();
        vars.insert("REDIRECT_URI", "http://127.0.0.1:53682/oauth/callback".to_string());
        let config = load(&vars).unwrap();
        assert_eq!(config.callback_addr(), "127.0.0.1:53682");

        // Explicit values still win
        vars.insert("CALLBACK_HOST", "0.0.0.0".to_string());
        vars.insert("CALLBACK_PORT", "9000".to_string());
        assert_eq!(load(&vars).unwrap().callback_addr(), "0.0.0.0:9000");

        // Scheme default port when the URI has none
        vars.remove("CALLBACK_HOST");
        vars.remove("CALLBACK_PORT");
        vars.insert("REDIRECT_URI", "http://localhost/".to_string());
        assert_eq!(load(&vars).unwrap().callback_addr(), "localhost:80");
    }

    #[test]
    fn test_invalid_redirect_uri() {
        let mut vars = base_vars();
        vars.insert("REDIRECT_URI", "not a url".to_string());
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { var: "REDIRECT_URI", .. })
        ));
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/tokens/token_details.json");
        assert!(path.to_string_lossy().contains("tokens/token_details.json"));
        assert!(!path.to_string_lossy().starts_with('~'));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));

        // Just "~" without slash should not expand
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
    }

    #[test]
    fn test_env_file_render() {
        let env = EnvFile {
            client_id: "cid".to_string(),
            client_secret: "sec".to_string(),
            tenant_id: "consumers".to_string(),
            scope: "Mail.Read".to_string(),
            redirect_uri: "http://localhost:8000/".to_string(),
            refresh_token: "rt".to_string(),
            access_token: "at".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            add_token_response_to_file: true,
        };
        let rendered = env.render();
        assert!(rendered.starts_with("CLIENT_ID=cid\n"));
        assert!(rendered.contains("REFRESH_TOKEN=rt\n"));
        assert!(rendered.contains("ACCESS_TOKEN=at\n"));
        assert!(rendered.ends_with("ADD_TOKEN_RESPONSE_TO_FILE=True\n"));

        // The rendered file must satisfy the startup validation
        let vars: HashMap<String, String> = rendered
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();
        assert_eq!(config.client_id, "cid");
        assert!(config.add_token_response_to_file);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = CliArgs::try_parse_from(["outlook-oauth", "check", "--force-refresh"]).unwrap();
        assert_eq!(args.command, Command::Check { force_refresh: true });
        assert_eq!(args.env_file, PathBuf::from(".env"));

        let args = CliArgs::try_parse_from(["outlook-oauth", "mark-unread", "a", "b"]).unwrap();
        assert_eq!(
            args.command,
            Command::MarkUnread {
                ids: vec!["a".to_string(), "b".to_string()]
            }
        );

        assert!(CliArgs::try_parse_from(["outlook-oauth", "mark-unread"]).is_err());
    }
}
