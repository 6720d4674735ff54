//! Browser profile preparation: trust the interceptor's CA certificate and
//! hand every session its own copy of the profile.

use std::path::Path;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::BrowserConfig;

use super::BrowserError;

/// Nickname the interceptor certificate is stored under.
pub const CERT_NICKNAME: &str = "yieldsync-interceptor";

const TRUST_FLAGS: &str = "TCu,Cuw,Tuw";

/// Files a running browser holds in its profile; never copied.
const LOCK_FILES: [&str; 3] = ["lock", ".parentlock", "parent.lock"];

/// Install the configured CA certificate into the configured profile.
///
/// No-op unless both `profile_dir` and `ca_cert_path` are set. Skips the
/// import when the profile already lists the certificate.
pub async fn prepare_profile(config: &BrowserConfig) -> Result<(), BrowserError> {
    let (Some(profile_dir), Some(cert_path)) = (&config.profile_dir, &config.ca_cert_path) else {
        return Ok(());
    };

    if !cert_path.exists() {
        return Err(BrowserError::Profile(format!(
            "certificate not found: {}",
            cert_path.display()
        )));
    }

    tokio::fs::create_dir_all(profile_dir).await?;
    let db = cert_db(profile_dir);

    if is_installed(&config.certutil_path, &db).await? {
        debug!(profile = %profile_dir.display(), "Interceptor certificate already trusted");
        return Ok(());
    }

    let output = Command::new(&config.certutil_path)
        .args(["-A", "-n", CERT_NICKNAME, "-t", TRUST_FLAGS, "-i"])
        .arg(cert_path)
        .args(["-d", db.as_str()])
        .output()
        .await
        .map_err(|e| spawn_error(&config.certutil_path, e))?;

    if !output.status.success() {
        return Err(BrowserError::Profile(format!(
            "certutil import failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    info!(profile = %profile_dir.display(), "Installed interceptor certificate");
    Ok(())
}

/// Copy the `template` profile into a fresh temporary directory.
///
/// The directory is removed when the returned handle is dropped.
pub async fn copy_profile(template: &Path) -> Result<TempDir, BrowserError> {
    if !template.is_dir() {
        return Err(BrowserError::Profile(format!(
            "profile directory not found: {}",
            template.display()
        )));
    }

    let copy = tempfile::Builder::new()
        .prefix("yieldsync-profile-")
        .tempdir()?;

    let mut pending = vec![(template.to_path_buf(), copy.path().to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let target = to.join(&name);
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                tokio::fs::create_dir(&target).await?;
                pending.push((entry.path(), target));
            } else if file_type.is_file() && !LOCK_FILES.iter().any(|lock| name == *lock) {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }

    debug!(template = %template.display(), copy = %copy.path().display(), "Copied browser profile");
    Ok(copy)
}

async fn is_installed(certutil: &str, db: &str) -> Result<bool, BrowserError> {
    let output = Command::new(certutil)
        .args(["-L", "-d", db])
        .output()
        .await
        .map_err(|e| spawn_error(certutil, e))?;

    // A fresh profile has no database yet; certutil -L fails and -A creates it.
    if !output.status.success() {
        return Ok(false);
    }

    Ok(lists_nickname(&String::from_utf8_lossy(&output.stdout)))
}

fn lists_nickname(listing: &str) -> bool {
    listing
        .lines()
        .any(|line| line.trim_start().starts_with(CERT_NICKNAME))
}

fn cert_db(profile_dir: &Path) -> String {
    format!("sql:{}", profile_dir.display())
}

fn spawn_error(certutil: &str, e: std::io::Error) -> BrowserError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BrowserError::Profile(format!("certutil not found at: {}", certutil))
    } else {
        BrowserError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prepare_profile_noop_without_paths() {
        let config = BrowserConfig::default();
        assert!(prepare_profile(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_prepare_profile_missing_certificate() {
        let temp = TempDir::new().unwrap();
        let config = BrowserConfig {
            profile_dir: Some(temp.path().join("profile")),
            ca_cert_path: Some(temp.path().join("missing.pem")),
            ..Default::default()
        };

        let result = prepare_profile(&config).await;
        assert!(matches!(result, Err(BrowserError::Profile(_))));
    }

    #[tokio::test]
    async fn test_prepare_profile_missing_certutil() {
        let temp = TempDir::new().unwrap();
        let cert = temp.path().join("ca.pem");
        std::fs::write(&cert, "-----BEGIN CERTIFICATE-----").unwrap();

        let config = BrowserConfig {
            profile_dir: Some(temp.path().join("profile")),
            ca_cert_path: Some(cert),
            certutil_path: "/nonexistent/certutil".to_string(),
            ..Default::default()
        };

        let err = prepare_profile(&config).await.unwrap_err();
        assert!(err.to_string().contains("certutil not found"));
    }

    #[tokio::test]
    async fn test_copy_profile_keeps_tree_without_locks() {
        let template = TempDir::new().unwrap();
        std::fs::write(template.path().join("prefs.js"), "user_pref(\"a\", 1);").unwrap();
        std::fs::write(template.path().join("parent.lock"), "").unwrap();
        std::fs::create_dir(template.path().join("storage")).unwrap();
        std::fs::write(template.path().join("storage").join("ls.db"), "x").unwrap();

        let copy = copy_profile(template.path()).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(copy.path().join("prefs.js")).unwrap(),
            "user_pref(\"a\", 1);"
        );
        assert!(copy.path().join("storage").join("ls.db").exists());
        assert!(!copy.path().join("parent.lock").exists());

        let path = copy.path().to_path_buf();
        drop(copy);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_copy_profile_missing_template() {
        let temp = TempDir::new().unwrap();
        let result = copy_profile(&temp.path().join("absent")).await;
        assert!(matches!(result, Err(BrowserError::Profile(_))));
    }

    #[test]
    fn test_lists_nickname() {
        let listing = "\
Certificate Nickname                                         Trust Attributes
                                                             SSL,S/MIME,JAR/XPI

yieldsync-interceptor                                        CT,C,C
";
        assert!(lists_nickname(listing));
        assert!(!lists_nickname("Certificate Nickname   Trust Attributes\n"));
    }

    #[test]
    fn test_cert_db_uses_sql_prefix() {
        assert_eq!(cert_db(Path::new("/tmp/p")), "sql:/tmp/p");
    }
}
