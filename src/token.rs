//! Downloads a client configuration token and installs it.
//!
//! The sequence is strict:
//! 1. GET the configured URL (certificate checks optionally disabled for
//!    this request's client only).
//! 2. Take the file name from `Content-Disposition`.
//! 3. Stream the body into a temporary file next to the target, fsync it and
//!    rename it into place.
//! 4. Only then delete the other `*.tok` files in the directory.
//!
//! Failures in steps 1-3 abort the refresh. Failures in step 4 are logged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{NvidiaConfig, ServerConfig, DEFAULT_TIMEOUT_SECS};
use crate::errors::{LicenseError, LicenseResult};

/// Extension shared by every client configuration token.
pub const TOKEN_EXTENSION: &str = "tok";

/// A token that was written to the destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenArtifact {
    /// Final location of the new token.
    pub path: PathBuf,
    /// Size of the downloaded body.
    pub bytes_written: u64,
    /// Older tokens that were removed after the new one was in place.
    pub superseded: Vec<PathBuf>,
}

/// Something that can fetch and install a fresh token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self) -> LicenseResult<TokenArtifact>;
}

/// Fetches tokens from the license server over HTTP(S).
#[derive(Debug, Clone)]
pub struct TokenAcquirer {
    server_url: String,
    destination_dir: PathBuf,
    skip_tls_verify: bool,
    timeout: Duration,
}

impl TokenAcquirer {
    pub fn new(
        server_url: impl Into<String>,
        destination_dir: impl Into<PathBuf>,
        skip_tls_verify: bool,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            destination_dir: destination_dir.into(),
            skip_tls_verify,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn from_config(server: &ServerConfig, nvidia: &NvidiaConfig) -> Self {
        Self::new(&server.url, &nvidia.token_dir, server.ignore_ssl).with_timeout(server.timeout())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn http_client(&self) -> LicenseResult<Client> {
        let client = Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.skip_tls_verify)
            .build()?;
        Ok(client)
    }
}

#[async_trait]
impl TokenSource for TokenAcquirer {
    async fn acquire(&self) -> LicenseResult<TokenArtifact> {
        let client = self.http_client()?;

        if self.skip_tls_verify {
            warn!(url = %self.server_url, "TLS certificate verification disabled for token download");
        }

        let mut resp = client.get(&self.server_url).send().await?;

        if !resp.status().is_success() {
            return Err(LicenseError::ServerError(format!(
                "token download failed with HTTP status {}",
                resp.status()
            )));
        }

        let header = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .ok_or(LicenseError::MissingContentDisposition)?
            .to_str()
            .map_err(|e| LicenseError::InvalidContentDisposition(e.to_string()))?;
        let filename = token_filename(header)?;

        fs::create_dir_all(&self.destination_dir).await?;
        let path = self.destination_dir.join(&filename);
        let partial = self.destination_dir.join(format!(".{filename}.partial"));

        let bytes_written = match write_durably(&mut resp, &partial).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        sync_dir(&self.destination_dir).await;

        info!(path = %path.display(), bytes = bytes_written, "Wrote license token");

        let superseded = remove_stale_tokens(&self.destination_dir, &path).await;

        Ok(TokenArtifact {
            path,
            bytes_written,
            superseded,
        })
    }
}

/// Download a token once. See [`TokenAcquirer`].
pub async fn acquire_token(
    server_url: &str,
    destination_dir: &Path,
    skip_tls_verify: bool,
) -> LicenseResult<TokenArtifact> {
    TokenAcquirer::new(server_url, destination_dir, skip_tls_verify)
        .acquire()
        .await
}

async fn write_durably(resp: &mut reqwest::Response, path: &Path) -> LicenseResult<u64> {
    let mut file = fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    match fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                debug!(dir = %dir.display(), error = %e, "Failed to sync token directory");
            }
        }
        Err(e) => debug!(dir = %dir.display(), error = %e, "Failed to open token directory"),
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

/// Delete every `*.tok` entry in `dir` other than `keep`.
///
/// Returns the files that were removed. Entries that cannot be removed
/// (a directory named `*.tok`, a permission problem) are logged and skipped.
pub async fn remove_stale_tokens(dir: &Path, keep: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to list token directory");
            return removed;
        }
    };

    let keep_name = keep.file_name();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to read token directory entry");
                break;
            }
        };

        let path = entry.path();
        if !is_token_file(&path) || path.file_name() == keep_name {
            continue;
        }

        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Removed superseded license token");
                removed.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove superseded license token");
            }
        }
    }

    removed
}

fn is_token_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(TOKEN_EXTENSION))
}

/// Make a server-supplied name safe to use as a file name.
///
/// Colons are not allowed in Windows path components.
pub fn sanitize_filename(name: &str) -> String {
    name.replace(':', "_")
}

/// Extract and sanitize the token file name from a `Content-Disposition`
/// header value.
pub fn token_filename(header: &str) -> LicenseResult<String> {
    let raw = content_disposition_filename(header)?;
    let sanitized = sanitize_filename(&raw);

    // Keep only the last path component.
    let name = sanitized
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(LicenseError::InvalidContentDisposition(format!(
            "unusable file name '{raw}'"
        )));
    }
    Ok(name.to_string())
}

/// Read the `filename` parameter of a `Content-Disposition` value.
///
/// An RFC 5987 `filename*` parameter takes precedence over `filename`.
pub fn content_disposition_filename(header: &str) -> LicenseResult<String> {
    let mut parts = split_params(header).into_iter();
    let disposition = parts.next().unwrap_or_default();
    if disposition.trim().is_empty() {
        return Err(LicenseError::InvalidContentDisposition(
            "missing disposition type".to_string(),
        ));
    }

    let mut plain = None;
    let mut extended = None;

    // Some servers omit the disposition type and start with a parameter.
    let params = std::iter::once(disposition)
        .filter(|first| first.contains('='))
        .chain(parts);

    for param in params {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "filename" => plain = Some(unquote(value.trim())),
            "filename*" => extended = decode_extended(value.trim()),
            _ => {}
        }
    }

    extended
        .or(plain)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            LicenseError::InvalidContentDisposition(format!("no filename parameter in '{header}'"))
        })
}

/// Split on `;` outside of quoted strings.
fn split_params(header: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in header.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Decode `charset'language'percent-encoded` (RFC 5987).
fn decode_extended(value: &str) -> Option<String> {
    let mut pieces = value.splitn(3, '\'');
    let charset = pieces.next()?;
    let _language = pieces.next()?;
    let encoded = pieces.next()?;

    if !(charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("us-ascii")) {
        debug!(charset, "Ignoring filename* with unsupported charset");
        return None;
    }
    urlencoding::decode(encoded).ok().map(|s| s.into_owned())
}
