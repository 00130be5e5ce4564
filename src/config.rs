use std::path::PathBuf;

use url::Url;

use crate::error::Error;

/// Base URL used when none is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000/api";

/// Storage key of the persisted token.
pub const DEFAULT_TOKEN_KEY: &str = "auth_token";

/// Paths of the auth endpoints, relative to the base URL.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthEndpoints {
    pub login: String,
    pub register: String,
    pub logout: String,
    pub profile: String,
    pub oauth_authorize: String,
    pub oauth_callback: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".into(),
            register: "/auth/register".into(),
            logout: "/auth/logout".into(),
            profile: "/auth/me".into(),
            oauth_authorize: "/auth/oauth".into(),
            oauth_callback: "/auth/oauth/callback".into(),
        }
    }
}

impl AuthEndpoints {
    #[must_use]
    pub fn with_login(mut self, path: impl Into<String>) -> Self {
        self.login = path.into();
        self
    }

    #[must_use]
    pub fn with_register(mut self, path: impl Into<String>) -> Self {
        self.register = path.into();
        self
    }

    #[must_use]
    pub fn with_logout(mut self, path: impl Into<String>) -> Self {
        self.logout = path.into();
        self
    }

    #[must_use]
    pub fn with_profile(mut self, path: impl Into<String>) -> Self {
        self.profile = path.into();
        self
    }

    #[must_use]
    pub fn with_oauth_authorize(mut self, path: impl Into<String>) -> Self {
        self.oauth_authorize = path.into();
        self
    }

    #[must_use]
    pub fn with_oauth_callback(mut self, path: impl Into<String>) -> Self {
        self.oauth_callback = path.into();
        self
    }
}

/// Request client configuration.
///
/// ```rust,ignore
/// use washline_client::ClientConfig;
///
/// let config = ClientConfig::new("https://api.washline.app/v1".parse()?)
///     .with_token_path("/var/lib/washline/session.json");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) base_url: Url,
    pub(crate) token_key: String,
    pub(crate) token_path: Option<PathBuf>,
    pub(crate) endpoints: AuthEndpoints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(default_base_url())
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            token_key: DEFAULT_TOKEN_KEY.into(),
            token_path: None,
            endpoints: AuthEndpoints::default(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `WASHLINE_API_URL`: API base URL (default [`DEFAULT_BASE_URL`])
    /// - `WASHLINE_TOKEN_PATH`: file the token is persisted to
    /// - `WASHLINE_TOKEN_KEY`: storage key (default `auth_token`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but invalid.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let base_url = match lookup("WASHLINE_API_URL").filter(|v| !v.trim().is_empty()) {
            Some(raw) => parse_base_url(raw.trim())
                .map_err(|e| Error::Config(format!("WASHLINE_API_URL: {e}")))?,
            None => default_base_url(),
        };

        let mut config = Self::new(base_url);

        if let Some(path) = lookup("WASHLINE_TOKEN_PATH").filter(|v| !v.is_empty()) {
            config = config.with_token_path(path);
        }
        if let Some(key) = lookup("WASHLINE_TOKEN_KEY") {
            if key.trim().is_empty() {
                return Err(Error::Config("WASHLINE_TOKEN_KEY must not be empty".into()));
            }
            config = config.with_token_key(key.trim());
        }

        Ok(config)
    }

    /// Override the storage key of the persisted token.
    #[must_use]
    pub fn with_token_key(mut self, key: impl Into<String>) -> Self {
        self.token_key = key.into();
        self
    }

    /// Override the file the token is persisted to.
    #[must_use]
    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_endpoints(mut self, endpoints: AuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn token_key(&self) -> &str {
        &self.token_key
    }

    #[must_use]
    pub fn token_path(&self) -> Option<&PathBuf> {
        self.token_path.as_ref()
    }

    #[must_use]
    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }
}

pub(crate) fn default_base_url() -> Url {
    DEFAULT_BASE_URL.parse().expect("valid default URL")
}

/// Parses an absolute URL that can serve as a path prefix.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    if url.cannot_be_a_base() {
        return Err(format!("`{raw}` cannot be used as a base URL"));
    }
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme `{}`", url.scheme()));
    }
    Ok(url)
}
