//! Image archive download onto provider hosts.
//!
//! Archives are fetched by the host itself (`curl` over the provider's
//! shell) into a deterministic path keyed by image name, URL and
//! architecture, so repeated creates reuse a finished download. Downloads
//! land in a `.tmp` file and are renamed only on success.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::transport::{shell_quote, RemoteSession};

/// Default directory for downloaded archives on the host.
pub const DEFAULT_DOWNLOAD_DIR: &str = "/usr/local/bin/virtfleet_images";

/// Mirror probe timeout.
const PROBE_TIMEOUT_SECS: u64 = 6;

/// Upper bound of a single archive download.
const DOWNLOAD_TIMEOUT_SECS: u64 = 1800;

/// Image mirror configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnConfig {
    /// Mirror prefixes, tried in order; the origin URL is appended.
    pub endpoints: Vec<String>,
    /// Directory on the host that holds downloaded archives.
    pub download_dir: String,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            download_dir: DEFAULT_DOWNLOAD_DIR.to_string(),
        }
    }
}

impl CdnConfig {
    /// Load from `CDN_ENDPOINTS` (comma separated) and `IMAGE_DOWNLOAD_DIR`.
    #[must_use]
    pub fn from_env() -> Self {
        let endpoints = std::env::var("CDN_ENDPOINTS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let download_dir = std::env::var("IMAGE_DOWNLOAD_DIR")
            .unwrap_or_else(|_| DEFAULT_DOWNLOAD_DIR.to_string());
        Self {
            endpoints,
            download_dir,
        }
    }
}

/// Deterministic archive file name: readable image name plus a short hash of
/// `(name, url, architecture)`.
#[must_use]
pub fn archive_file_name(name: &str, url: &str, architecture: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .collect();
    let digest = blake3::hash(format!("{name}_{url}_{architecture}").as_bytes());
    let short = hex::encode(&digest.as_bytes()[..4]);
    format!("{safe}_{short}.tar")
}

/// Downloads archives through a provider session.
pub struct ImageFetcher<'a> {
    session: &'a RemoteSession,
    cdn: &'a CdnConfig,
}

impl<'a> ImageFetcher<'a> {
    /// Create a fetcher.
    #[must_use]
    pub const fn new(session: &'a RemoteSession, cdn: &'a CdnConfig) -> Self {
        Self { session, cdn }
    }

    /// Remote path of the archive for an image.
    #[must_use]
    pub fn archive_path(&self, name: &str, url: &str, architecture: &str) -> String {
        format!(
            "{}/{}",
            self.cdn.download_dir.trim_end_matches('/'),
            archive_file_name(name, url, architecture)
        )
    }

    /// Pick the first mirror that serves `url`, falling back to the origin.
    pub async fn resolve_url(&self, url: &str) -> String {
        for endpoint in &self.cdn.endpoints {
            let candidate = format!("{endpoint}{url}");
            let probe = format!(
                "curl -4 -sfL -k --max-time {PROBE_TIMEOUT_SECS} -r 0-0 -o /dev/null {}",
                shell_quote(&candidate)
            );
            match self
                .session
                .run_with_timeout(&probe, Duration::from_secs(PROBE_TIMEOUT_SECS + 5))
                .await
            {
                Ok(output) if output.success() => {
                    debug!(endpoint = %endpoint, "Using image mirror");
                    return candidate;
                }
                Ok(_) => debug!(endpoint = %endpoint, "Image mirror unavailable"),
                Err(e) => debug!(endpoint = %endpoint, error = %e, "Image mirror probe failed"),
            }
        }
        url.to_string()
    }

    /// Download the archive unless a non-empty copy already exists.
    ///
    /// Returns the archive path.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails; partial files are removed.
    pub async fn download(&self, name: &str, url: &str, architecture: &str) -> Result<String> {
        let path = self.archive_path(name, url, architecture);
        let quoted = shell_quote(&path);

        if self.session.succeeds(&format!("test -s {quoted}")).await? {
            info!(image = %name, path = %path, "Archive already present, skipping download");
            return Ok(path);
        }

        let source = self.resolve_url(url).await;
        let tmp = shell_quote(&format!("{path}.tmp"));
        let command = format!(
            "mkdir -p {dir} && curl -L --fail --max-time {DOWNLOAD_TIMEOUT_SECS} --retry 3 --retry-delay 5 -o {tmp} {src} && mv {tmp} {quoted}",
            dir = shell_quote(&self.cdn.download_dir),
            src = shell_quote(&source),
        );
        info!(image = %name, source = %source, path = %path, "Downloading image archive");

        let result = self
            .session
            .run_with_timeout(&command, Duration::from_secs(DOWNLOAD_TIMEOUT_SECS + 60))
            .await
            .and_then(|output| output.into_stdout(&command));
        if let Err(e) = result {
            self.remove(&format!("{path}.tmp")).await;
            self.remove(&path).await;
            return Err(e);
        }
        Ok(path)
    }

    /// Remove a file on the host, logging failures.
    pub async fn remove(&self, path: &str) {
        let command = format!("rm -f {}", shell_quote(path));
        if let Err(e) = self.session.exec(&command).await {
            warn!(path = %path, error = %e, "Failed to remove remote file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockShell;
    use std::sync::Arc;

    fn session(shell: &Arc<MockShell>) -> RemoteSession {
        RemoteSession::new(
            Arc::clone(shell) as Arc<dyn crate::transport::RemoteShell>,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn archive_names_are_stable_and_safe() {
        let a = archive_file_name("library/nginx:1.25", "https://x/nginx.tar", "amd64");
        let b = archive_file_name("library/nginx:1.25", "https://x/nginx.tar", "amd64");
        let c = archive_file_name("library/nginx:1.25", "https://x/nginx.tar", "arm64");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("library_nginx_1.25_"));
        assert!(a.ends_with(".tar"));
        assert_eq!(a.len(), "library_nginx_1.25_".len() + 8 + ".tar".len());
    }

    #[tokio::test]
    async fn existing_archive_is_reused() {
        let shell = Arc::new(MockShell::new());
        let session = session(&shell);
        let cdn = CdnConfig::default();
        let fetcher = ImageFetcher::new(&session, &cdn);

        let path = fetcher.download("alpine", "https://o/alpine.tar", "amd64").await.unwrap();
        assert!(path.starts_with(DEFAULT_DOWNLOAD_DIR));
        assert!(shell.commands_matching("curl").is_empty());
    }

    #[tokio::test]
    async fn first_responsive_mirror_wins() {
        let shell = Arc::new(MockShell::new());
        shell.respond_failure("test -s", "", 1);
        shell.respond_failure("https://slow.example/", "", 28);
        let session = session(&shell);
        let cdn = CdnConfig {
            endpoints: vec!["https://slow.example/".into(), "https://fast.example/".into()],
            ..CdnConfig::default()
        };
        let fetcher = ImageFetcher::new(&session, &cdn);

        fetcher.download("alpine", "https://o/alpine.tar", "amd64").await.unwrap();
        let downloads = shell.commands_matching("--retry 3");
        assert_eq!(downloads.len(), 1);
        assert!(downloads[0].contains("https://fast.example/https://o/alpine.tar"));
        assert!(downloads[0].contains(".tmp"));
    }

    #[tokio::test]
    async fn failed_download_removes_partial_files() {
        let shell = Arc::new(MockShell::new());
        shell.respond_failure("test -s", "", 1);
        shell.respond_failure("--retry 3", "curl: (22) 404", 22);
        let session = session(&shell);
        let cdn = CdnConfig::default();
        let fetcher = ImageFetcher::new(&session, &cdn);

        assert!(fetcher.download("alpine", "https://o/alpine.tar", "amd64").await.is_err());
        assert_eq!(shell.commands_matching("rm -f").len(), 2);
    }
}
