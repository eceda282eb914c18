use std::time::Duration;

use crate::errors::ClientError;

/// Configuration for [`HttpChatBackend`](crate::http::HttpChatBackend).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Scheme and host of the service, for example `http://localhost:8000`.
    pub base_url: String,
    /// Path prefix of the API routes.
    pub api_prefix: String,
    /// Bearer token sent with every request when set.
    pub access_token: Option<String>,
    /// HTTP timeout applied to every request, streams included.
    pub timeout: Duration,
    /// Number of conversations fetched per list call.
    pub page_size: u32,
}

impl ClientConfig {
    /// Creates a config with defaults for everything but the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_prefix: "/api/v1".to_string(),
            access_token: None,
            timeout: Duration::from_secs(120),
            page_size: 50,
        }
    }

    /// Builds a config from `NL2SQL_*` environment variables.
    ///
    /// - `NL2SQL_BASE_URL` (required)
    /// - `NL2SQL_API_PREFIX`
    /// - `NL2SQL_ACCESS_TOKEN`
    /// - `NL2SQL_TIMEOUT_SECS`
    /// - `NL2SQL_PAGE_SIZE`
    pub fn from_env() -> Result<Self, ClientError> {
        let base_url = std::env::var("NL2SQL_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ClientError::Config("missing NL2SQL_BASE_URL".into()));
        }
        let mut config = Self::new(base_url);
        if let Some(prefix) = non_empty_env("NL2SQL_API_PREFIX") {
            config = config.api_prefix(prefix);
        }
        if let Some(token) = non_empty_env("NL2SQL_ACCESS_TOKEN") {
            config = config.access_token(token);
        }
        if let Some(raw) = non_empty_env("NL2SQL_TIMEOUT_SECS") {
            let secs: u64 = raw
                .parse()
                .map_err(|e| ClientError::Config(format!("invalid NL2SQL_TIMEOUT_SECS: {e}")))?;
            config = config.timeout(Duration::from_secs(secs));
        }
        if let Some(raw) = non_empty_env("NL2SQL_PAGE_SIZE") {
            let size: u32 = raw
                .parse()
                .map_err(|e| ClientError::Config(format!("invalid NL2SQL_PAGE_SIZE: {e}")))?;
            config = config.page_size(size);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Checks the values the server would reject anyway.
    pub fn validate(&self) -> Result<(), ClientError> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "base_url must start with http:// or https://, got `{url}`"
            )));
        }
        if !(1..=100).contains(&self.page_size) {
            return Err(ClientError::Config(
                "page_size must be between 1 and 100".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ClientError::Config("timeout must be greater than 0".into()));
        }
        Ok(())
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        let prefix = self.api_prefix.trim_matches('/');
        let base = self.base_url.trim_end_matches('/');
        if prefix.is_empty() {
            format!("{base}{path}")
        } else {
            format!("{base}/{prefix}{path}")
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
