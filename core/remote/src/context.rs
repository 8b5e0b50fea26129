//! PCE connection context.

use std::fmt;
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

use pcemirror_common::{Error, Result};

/// Default page size for collection and result listing.
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Credentials presented to the PCE.
#[derive(Clone)]
pub enum Credentials {
    /// API key pair, sent as HTTP basic auth.
    ApiKey {
        key: String,
        secret: Zeroizing<String>,
    },
    /// Browser session: CSRF token header plus `JSESSIONID` cookie.
    Session {
        csrf_token: Zeroizing<String>,
        session_cookie: Zeroizing<String>,
    },
    /// No credentials (test servers).
    Anonymous,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey { key, .. } => f
                .debug_struct("ApiKey")
                .field("key", key)
                .field("secret", &"<redacted>")
                .finish(),
            Self::Session { .. } => f.write_str("Session { <redacted> }"),
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Everything needed to talk to one PCE organization.
#[derive(Debug, Clone)]
pub struct PceContext {
    pub base_url: Url,
    pub org_id: u32,
    pub credentials: Credentials,
    pub verify_tls: bool,
    pub timeout: Duration,
    pub page_size: u32,
}

impl PceContext {
    /// Create a context with default TLS, timeout and page size settings.
    ///
    /// # Errors
    /// - `Config` if `base_url` is not an absolute http(s) URL
    pub fn new(base_url: &str, org_id: u32, credentials: Credentials) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid PCE URL '{base_url}': {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "PCE URL must use http or https, got '{}'",
                base_url.scheme()
            )));
        }

        Ok(Self {
            base_url,
            org_id,
            credentials,
            verify_tls: true,
            timeout: Duration::from_secs(30),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Set TLS certificate verification.
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Set request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set page size; zero is raised to one.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// URL of an org-scoped endpoint, e.g. `labels` or `sec_policy/draft/services`.
    pub fn org_url(&self, endpoint: &str) -> Result<Url> {
        self.api_url(&format!("orgs/{}/{}", self.org_id, endpoint.trim_start_matches('/')))
    }

    /// URL of an href returned by the PCE (`/orgs/1/...`).
    pub fn href_url(&self, href: &str) -> Result<Url> {
        self.api_url(href.trim_start_matches('/'))
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/api/v2/{path}"))
            .map_err(|e| Error::Config(format!("Invalid PCE endpoint '{path}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let context = PceContext::new("https://pce.example.com:8443/", 3, Credentials::Anonymous)
            .unwrap();

        assert_eq!(
            context.org_url("sec_policy/draft/ip_lists").unwrap().as_str(),
            "https://pce.example.com:8443/api/v2/orgs/3/sec_policy/draft/ip_lists"
        );
        assert_eq!(
            context
                .href_url("/orgs/3/traffic_flows/async_queries/abc")
                .unwrap()
                .as_str(),
            "https://pce.example.com:8443/api/v2/orgs/3/traffic_flows/async_queries/abc"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(PceContext::new("not a url", 1, Credentials::Anonymous).is_err());
        assert!(PceContext::new("ftp://pce", 1, Credentials::Anonymous).is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let credentials = Credentials::ApiKey {
            key: "api_123".to_string(),
            secret: Zeroizing::new("hunter2".to_string()),
        };
        let debug = format!("{credentials:?}");
        assert!(debug.contains("api_123"));
        assert!(!debug.contains("hunter2"));
    }
}
