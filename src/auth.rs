//! OAuth2 authentication management for the Gmail API
//!
//! This transfer system only ever reads from Gmail -- it never modifies,
//! labels, or deletes anything on the source side -- so it requests the
//! narrowest possible scope.

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TransferError};

/// Gmail API scope required by this system: read-only access to list
/// labels, list messages, and fetch raw message bytes.
pub const REQUIRED_SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.readonly"];

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Authenticate and initialize Gmail API hub with OAuth2
///
/// # Arguments
/// * `credentials_path` - Path to the OAuth2 credentials JSON file
/// * `token_cache_path` - Path where access tokens will be cached
pub async fn authenticate(credentials_path: &Path, token_cache_path: &Path) -> Result<GmailHub> {
    initialize_gmail_hub(credentials_path, token_cache_path).await
}

/// Initialize Gmail API hub with OAuth2 authentication
///
/// Sets up the complete Gmail API client with:
/// - OAuth2 authentication using InstalledFlow (desktop app flow)
/// - Token persistence to disk for automatic refresh
/// - HTTP/1 client with TLS support
pub async fn initialize_gmail_hub(
    credentials_path: &Path,
    token_cache_path: &Path,
) -> Result<GmailHub> {
    let secret = yup_oauth2::read_application_secret(credentials_path)
        .await
        .map_err(|e| TransferError::AuthError(format!("Failed to read credentials: {}", e)))?;

    // HTTPRedirect opens a browser for user authorization
    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| TransferError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Pre-authenticate so the cached token is already scoped correctly
    // before the fetcher/uploader stages start running concurrently.
    let _token = auth
        .token(REQUIRED_SCOPES)
        .await
        .map_err(|e| TransferError::AuthError(format!("Failed to obtain token: {}", e)))?;

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| TransferError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}

/// Credential structure matching Google's OAuth2 credentials JSON format
#[derive(Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub installed: InstalledApp,
}

/// Installed application credentials (desktop/CLI app)
#[derive(Debug, Serialize, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    pub project_id: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub client_secret: String,
    pub redirect_uris: Vec<String>,
}

/// Load OAuth2 credentials from a JSON file
pub async fn load_credentials(path: &Path) -> Result<Credentials> {
    let content = tokio::fs::read_to_string(path).await?;
    let creds = serde_json::from_str(&content)?;
    Ok(creds)
}

/// Secure token file permissions on Unix systems
///
/// Sets file permissions to 0600 (read/write for owner only) to prevent
/// unauthorized access to OAuth2 tokens.
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Secure token file on Windows (stub implementation)
///
/// Windows uses ACLs instead of Unix permissions.
#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_load_credentials() {
        let credentials_json = r#"{
            "installed": {
                "client_id": "test-client-id",
                "project_id": "test-project",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token",
                "client_secret": "test-secret",
                "redirect_uris": ["http://localhost:8080"]
            }
        }"#;

        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), credentials_json)
            .await
            .unwrap();

        let creds = load_credentials(temp_file.path()).await.unwrap();
        assert_eq!(creds.installed.client_id, "test-client-id");
        assert_eq!(creds.installed.project_id, "test-project");
        assert_eq!(creds.installed.client_secret, "test-secret");
    }

    #[tokio::test]
    async fn test_secure_token_file() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "test content")
            .await
            .unwrap();

        secure_token_file(temp_file.path()).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = tokio::fs::metadata(temp_file.path()).await.unwrap();
            let perms = metadata.permissions();
            assert_eq!(perms.mode() & 0o777, 0o600);
        }
    }

    #[test]
    fn test_scopes_constant_is_readonly() {
        assert_eq!(REQUIRED_SCOPES.len(), 1);
        assert_eq!(
            REQUIRED_SCOPES[0],
            "https://www.googleapis.com/auth/gmail.readonly"
        );
    }
}
