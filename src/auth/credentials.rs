// Credential persistence: token file load/save with archiving of superseded copies

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};

use super::types::{OAuthCredentials, PersistedToken, TokenArchiveEntry};
use crate::config::{Config, EnvFile};
use crate::error::StoreError;

/// Second-resolution timestamp used for archive names
pub fn timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// JSON token file plus the directory holding its archived predecessors
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    archive_dir: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.token_file, &config.token_archive_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load credentials from the token file
    pub fn load(&self) -> Result<OAuthCredentials, StoreError> {
        load_token_file(&self.path)
    }

    /// Persist credentials, archiving the current file first.
    ///
    /// Returns the archive entry when a previous file was superseded.
    pub fn save(&self, creds: &OAuthCredentials) -> Result<Option<TokenArchiveEntry>, StoreError> {
        ensure_json(&self.path)?;

        let archived = if self.exists() {
            let entry = archive_file(&self.path, &self.archive_dir, &file_stem(&self.path), Some("json"))?;
            tracing::info!("Archived previous token file to {}", entry.path.display());
            Some(entry)
        } else {
            tracing::debug!("No previous token file at {}", self.path.display());
            None
        };

        let persisted = PersistedToken::from_credentials(creds, timestamp());
        let body = serde_json::to_vec_pretty(&persisted)?;
        write_atomic(&self.path, &body)?;

        tracing::info!("Token details saved to {}", self.path.display());
        Ok(archived)
    }

    /// Archived snapshots, oldest name first
    pub fn archive_entries(&self) -> Result<Vec<PathBuf>, StoreError> {
        list_dir_sorted(&self.archive_dir)
    }
}

/// Read a JSON token file
pub fn load_token_file(path: &Path) -> Result<OAuthCredentials, StoreError> {
    ensure_json(path)?;

    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let persisted: PersistedToken = serde_json::from_slice(&raw)?;
    Ok(persisted.into_credentials())
}

/// Replace the .env file with one carrying the token pair from `token_file`.
///
/// The current .env is archived as `env_{timestamp}` inside `env_archive_dir`.
pub fn rewrite_env_file(
    token_file: &Path,
    env_path: &Path,
    env_archive_dir: &Path,
    config: &Config,
) -> Result<Option<TokenArchiveEntry>, StoreError> {
    let creds = load_token_file(token_file)?;
    let tokens = creds
        .tokens
        .ok_or_else(|| StoreError::MissingTokens(token_file.to_path_buf()))?;

    fs::create_dir_all(env_archive_dir).map_err(|e| StoreError::io(env_archive_dir, e))?;

    let archived = if env_path.is_file() {
        Some(archive_file(env_path, env_archive_dir, "env", None)?)
    } else {
        None
    };

    let env = EnvFile {
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
        tenant_id: config.tenant_id.clone(),
        scope: config.scope.clone(),
        redirect_uri: config.redirect_uri.clone(),
        refresh_token: tokens.refresh_token,
        access_token: tokens.access_token,
        base_url: config.base_url.clone(),
        add_token_response_to_file: true,
    };
    write_atomic(env_path, env.render().as_bytes())?;

    tracing::info!("Rewrote {} from {}", env_path.display(), token_file.display());
    Ok(archived)
}

fn ensure_json(path: &Path) -> Result<(), StoreError> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(())
    } else {
        Err(StoreError::UnsupportedFormat(path.to_path_buf()))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("token_details")
        .to_string()
}

/// Copy `source` into `archive_dir` under `{prefix}_{timestamp}[.ext]`.
///
/// Same-second collisions get a `_1`, `_2`, ... suffix; existing archives are never overwritten.
pub(crate) fn archive_file(
    source: &Path,
    archive_dir: &Path,
    prefix: &str,
    extension: Option<&str>,
) -> Result<TokenArchiveEntry, StoreError> {
    fs::create_dir_all(archive_dir).map_err(|e| StoreError::io(archive_dir, e))?;

    let ts = timestamp();
    let target = next_archive_path(archive_dir, prefix, &ts, extension);
    fs::copy(source, &target).map_err(|e| StoreError::io(&target, e))?;

    Ok(TokenArchiveEntry {
        path: target,
        timestamp: ts,
    })
}

fn next_archive_path(dir: &Path, prefix: &str, ts: &str, extension: Option<&str>) -> PathBuf {
    let name = |suffix: Option<u32>| {
        let base = match suffix {
            Some(n) => format!("{}_{}_{}", prefix, ts, n),
            None => format!("{}_{}", prefix, ts),
        };
        match extension {
            Some(ext) => format!("{}.{}", base, ext),
            None => base,
        }
    };

    let first = dir.join(name(None));
    if !first.exists() {
        return first;
    }

    let mut n = 1;
    loop {
        let candidate = dir.join(name(Some(n)));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Write to a sibling temp file then rename over the target
fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, body).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

fn list_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::TokenPair;
    use crate::config::tests::base_vars;
    use chrono::Utc;
    use std::collections::HashSet;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("outlook-oauth-store-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn creds(access: &str) -> OAuthCredentials {
        OAuthCredentials {
            client_id: "client-123".to_string(),
            client_secret: "secret-456".to_string(),
            tenant_id: "consumers".to_string(),
            scope: "offline_access Mail.ReadWrite".to_string(),
            tokens: Some(TokenPair {
                access_token: access.to_string(),
                refresh_token: format!("refresh-for-{}", access),
            }),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3600),
            issued_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = temp_dir();
        let store = CredentialStore::new(dir.join("token_details.json"), dir.join("old_tokens"));

        let original = creds("at-1");
        assert!(store.save(&original).unwrap().is_none());
        assert_eq!(store.load().unwrap(), original);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_persisted_layout_has_required_fields() {
        let dir = temp_dir();
        let store = CredentialStore::new(dir.join("token_details.json"), dir.join("old_tokens"));
        store.save(&creds("at-1")).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        for key in [
            "access_token",
            "refresh_token",
            "expires_in",
            "token_type",
            "timestamp",
            "client_id",
            "client_secret",
            "tenant_id",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["timestamp"].as_str().unwrap().len(), 14);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_each_overwrite_archives_once() {
        let dir = temp_dir();
        let store = CredentialStore::new(dir.join("token_details.json"), dir.join("old_tokens"));
        store.save(&creds("at-1")).unwrap();

        let first = store.save(&creds("at-2")).unwrap().unwrap();
        let second = store.save(&creds("at-3")).unwrap().unwrap();
        assert_ne!(first.path, second.path);

        let entries = store.archive_entries().unwrap();
        assert_eq!(entries.len(), 2);
        let unique: HashSet<_> = entries.iter().collect();
        assert_eq!(unique.len(), 2);

        // Archives hold the superseded credentials, not the new ones
        assert_eq!(load_token_file(&first.path).unwrap().access_token(), Some("at-1"));
        assert_eq!(load_token_file(&second.path).unwrap().access_token(), Some("at-2"));
        assert_eq!(store.load().unwrap().access_token(), Some("at-3"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_same_second_collision_gets_counter() {
        let dir = temp_dir();
        let ts = "20250101120000";
        fs::write(dir.join(format!("token_details_{}.json", ts)), b"{}").unwrap();
        fs::write(dir.join(format!("token_details_{}_1.json", ts)), b"{}").unwrap();

        let next = next_archive_path(&dir, "token_details", ts, Some("json"));
        assert_eq!(next, dir.join(format!("token_details_{}_2.json", ts)));

        let env_next = next_archive_path(&dir, "env", ts, None);
        assert_eq!(env_next, dir.join(format!("env_{}", ts)));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_unsupported_format() {
        let dir = temp_dir();
        let store = CredentialStore::new(dir.join("token_details.yaml"), dir.join("old_tokens"));
        assert!(matches!(store.load(), Err(StoreError::UnsupportedFormat(_))));
        assert!(matches!(store.save(&creds("x")), Err(StoreError::UnsupportedFormat(_))));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = temp_dir();
        let store = CredentialStore::new(dir.join("absent.json"), dir.join("old_tokens"));
        assert!(matches!(store.load(), Err(StoreError::NotFound(_))));
        assert!(store.archive_entries().unwrap().is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_rewrite_env_file_archives_previous() {
        let dir = temp_dir();
        let vars = base_vars();
        let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let token_file = dir.join("token_details.json");
        CredentialStore::new(&token_file, dir.join("old_tokens"))
            .save(&creds("fresh-at"))
            .unwrap();

        let env_path = dir.join(".env");
        fs::write(&env_path, "CLIENT_ID=old\n").unwrap();

        let archive_dir = dir.join("old_envs");
        let archived = rewrite_env_file(&token_file, &env_path, &archive_dir, &config)
            .unwrap()
            .unwrap();

        assert!(archived
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("env_"));
        assert_eq!(fs::read_to_string(&archived.path).unwrap(), "CLIENT_ID=old\n");

        let rewritten = fs::read_to_string(&env_path).unwrap();
        assert!(rewritten.contains("ACCESS_TOKEN=fresh-at\n"));
        assert!(rewritten.contains("REFRESH_TOKEN=refresh-for-fresh-at\n"));
        assert!(rewritten.contains("CLIENT_ID=client-123\n"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_rewrite_env_file_requires_json() {
        let dir = temp_dir();
        let vars = base_vars();
        let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let result = rewrite_env_file(&dir.join("tokens.txt"), &dir.join(".env"), &dir.join("old_envs"), &config);
        assert!(matches!(result, Err(StoreError::UnsupportedFormat(_))));

        let result = rewrite_env_file(&dir.join("missing.json"), &dir.join(".env"), &dir.join("old_envs"), &config);
        assert!(matches!(result, Err(StoreError::NotFound(_))));

        let _ = fs::remove_dir_all(dir);
    }
}
