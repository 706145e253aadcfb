use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use torrotate_common::RotatorConfig;
use tracing::debug;

/// Exit-IP verification failures
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no CA bundle available")]
    MissingCaBundle,

    #[error("failed to read CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid certificates in CA bundle: {0}")]
    Certificate(#[source] reqwest::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("echo service returned HTTP {0}")]
    Status(u16),
}

/// Fetches the address the outside world sees for our traffic
#[async_trait]
pub trait ExitIpProbe: Send + Sync {
    /// Raw response body of the echo service
    async fn fetch(&self) -> Result<String, ProbeError>;
}

/// GET against an IP-echo service through Tor's SOCKS port
pub struct HttpExitProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpExitProbe {
    pub fn from_config(config: &RotatorConfig) -> Result<Self, ProbeError> {
        let bundle_path = config.ca_bundle.clone().ok_or(ProbeError::MissingCaBundle)?;
        let pem = std::fs::read(&bundle_path).map_err(|source| ProbeError::CaBundle {
            path: bundle_path.clone(),
            source,
        })?;
        let certificates =
            reqwest::Certificate::from_pem_bundle(&pem).map_err(ProbeError::Certificate)?;
        debug!(
            path = %bundle_path.display(),
            count = certificates.len(),
            "Loaded CA bundle"
        );

        let proxy = reqwest::Proxy::all(config.socks_proxy_url()).map_err(ProbeError::Client)?;
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .proxy(proxy)
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.query_timeout_secs));
        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }

        Ok(Self {
            client: builder.build().map_err(ProbeError::Client)?,
            url: config.ip_echo_url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ExitIpProbe for HttpExitProbe {
    async fn fetch(&self) -> Result<String, ProbeError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}

#[derive(Deserialize)]
struct EchoBody {
    ip: String,
}

/// Pull the address out of an `{"ip": "..."}` body; plain-text bodies are used as-is
pub fn extract_ip(body: &str) -> Option<String> {
    if let Ok(echo) = serde_json::from_str::<EchoBody>(body) {
        return Some(echo.ip);
    }
    let trimmed = body.trim();
    let looks_like_address = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':');
    looks_like_address.then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_ip_from_json() {
        assert_eq!(
            extract_ip(r#"{"ip":"185.220.101.4"}"#).as_deref(),
            Some("185.220.101.4")
        );
    }

    #[test]
    fn test_extract_ip_from_plain_text() {
        assert_eq!(extract_ip("2a0b:f4c2::1\n").as_deref(), Some("2a0b:f4c2::1"));
        assert_eq!(extract_ip("<html>blocked</html>"), None);
        assert_eq!(extract_ip(""), None);
    }

    #[test]
    fn test_missing_ca_bundle() {
        let config = RotatorConfig::new().with_ca_bundle(None);
        assert!(matches!(
            HttpExitProbe::from_config(&config),
            Err(ProbeError::MissingCaBundle)
        ));
    }

    #[test]
    fn test_unreadable_ca_bundle() {
        let config =
            RotatorConfig::new().with_ca_bundle(Some(PathBuf::from("/nonexistent/ca.pem")));
        assert!(matches!(
            HttpExitProbe::from_config(&config),
            Err(ProbeError::CaBundle { .. })
        ));
    }
}
