//! Configuration discovery and credential storage
//!
//! Configs are plain `.ovpn`/`.conf` files in a single directory; the
//! discovery pass rebuilds the full list on every call. Credentials live
//! next to them in a two-line file, owner-readable only.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::vpn::types::{ConfigEntry, Credentials};

const CREDENTIALS_FILE: &str = "credentials";
const AUTH_FILE: &str = "auth.txt";

/// Default directory for configs and credentials
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ovpn-session")
}

/// List the OpenVPN config files in a directory, sorted by name
///
/// A missing directory yields an empty list rather than an error.
pub async fn discover_configs(dir: &Path) -> Result<Vec<ConfigEntry>> {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    while let Some(item) = reader.next_entry().await? {
        let path = item.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if matches!(ext, Some("ovpn") | Some("conf")) {
            if let Some(entry) = ConfigEntry::from_path(&path) {
                entries.push(entry);
            }
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Load stored credentials, if any
pub async fn load_credentials(dir: &Path) -> Result<Option<Credentials>> {
    let path = dir.join(CREDENTIALS_FILE);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut lines = text.lines();
    let username = lines.next().unwrap_or("").to_string();
    let secret = lines.next().unwrap_or("").to_string();
    Ok(Some(Credentials::new(username, secret)))
}

/// Persist credentials with owner-only permissions
pub async fn save_credentials(dir: &Path, creds: &Credentials) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(CREDENTIALS_FILE);
    write_secret_file(&path, &format!("{}\n{}\n", creds.username, creds.secret)).await?;
    Ok(path)
}

/// Write the `--auth-user-pass` file consumed by the subprocess
pub(crate) async fn write_auth_file(dir: &Path, creds: &Credentials) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(AUTH_FILE);
    write_secret_file(&path, &format!("{}\n{}\n", creds.username, creds.secret)).await?;
    Ok(path)
}

async fn write_secret_file(path: &Path, payload: &str) -> Result<()> {
    tokio::fs::write(path, payload).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_configs_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zz-tokyo.ovpn", "aa-amsterdam.ovpn", "server.conf", "notes.txt"] {
            tokio::fs::write(dir.path().join(name), "remote example 1194\n")
                .await
                .unwrap();
        }

        let entries = discover_configs(dir.path()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["aa-amsterdam", "server", "zz-tokyo"]);
    }

    #[tokio::test]
    async fn test_discover_configs_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(discover_configs(&missing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let creds = Credentials::new("alice", "hunter2");
        save_credentials(dir.path(), &creds).await.unwrap();

        let loaded = load_credentials(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.secret, "hunter2");
    }

    #[tokio::test]
    async fn test_load_credentials_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_credentials(dir.path()).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_auth_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = write_auth_file(dir.path(), &Credentials::new("alice", "hunter2"))
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let body = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(body, "alice\nhunter2\n");
    }
}
