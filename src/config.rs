//! Connection configuration for the xAPI wrapper.
//!
//! Caller-supplied [`WrapperOptions`] are merged over built-in defaults (or
//! over the current snapshot on update) and validated into an immutable
//! [`Config`]. The [`ConfigurationStore`] publishes snapshots as `Arc<Config>`
//! so a request being built never observes a half-applied update.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::ConfigError;

/// Placeholder endpoint used until the caller configures a real LRS
const DEFAULT_ENDPOINT: &str = "http://localhost:8080/xapi/";

/// Latest xAPI version this wrapper speaks
pub const DEFAULT_VERSION: &str = "1.0.3";

/// xAPI versions accepted in the `X-Experience-API-Version` header
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0.0", "1.0.1", "1.0.2", "1.0.3"];

/// Default number of delivery attempts per request (including the first)
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Upper bound on delivery attempts
const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Default per-attempt request timeout in milliseconds
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Shortest accepted per-attempt timeout
const MIN_TIMEOUT_MS: u64 = 100;

/// Longest accepted per-attempt timeout
const MAX_TIMEOUT_MS: u64 = 300_000;

/// Credentials presented to the LRS.
///
/// Deserializes from either `{"username": .., "password": ..}` or
/// `{"token": ..}`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Auth {
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
    Bearer {
        token: String,
    },
}

impl Auth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Auth::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Auth::Bearer {
            token: token.into(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Auth::Basic { username, .. } if username.trim().is_empty() => Err(
                ConfigError::for_field("auth", "basic credentials require a username"),
            ),
            Auth::Bearer { token } if token.trim().is_empty() => Err(ConfigError::for_field(
                "auth",
                "bearer token must not be empty",
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Auth::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Options supplied by the hosting application.
///
/// Every field is optional; unset fields keep the value of whatever they are
/// merged over.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapperOptions {
    pub endpoint: Option<String>,
    pub auth: Option<Auth>,
    pub version: Option<String>,
    pub actor: Option<Value>,
    pub max_attempts: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl WrapperOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth::basic(username, password));
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(Auth::bearer(token));
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn actor(mut self, actor: Value) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Load options from environment variables.
    ///
    /// Recognized variables:
    /// - `XAPI_ENDPOINT`: LRS base URL
    /// - `XAPI_USERNAME` / `XAPI_PASSWORD`: basic credentials
    /// - `XAPI_TOKEN`: bearer token (takes precedence over basic credentials)
    /// - `XAPI_VERSION`: xAPI version header value
    /// - `XAPI_MAX_ATTEMPTS`: delivery attempts per request
    /// - `XAPI_TIMEOUT_MS`: per-attempt timeout
    ///
    /// Unset variables are left as `None`; range checks happen when the
    /// options are applied to a [`ConfigurationStore`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a numeric variable is not a valid number.
    pub fn from_env() -> Result<Self, ConfigError> {
        let auth = match (env::var("XAPI_TOKEN"), env::var("XAPI_USERNAME")) {
            (Ok(token), _) => Some(Auth::bearer(token)),
            (Err(_), Ok(username)) => Some(Auth::basic(
                username,
                env::var("XAPI_PASSWORD").unwrap_or_default(),
            )),
            _ => None,
        };

        Ok(Self {
            endpoint: env::var("XAPI_ENDPOINT").ok(),
            auth,
            version: env::var("XAPI_VERSION").ok(),
            actor: None,
            max_attempts: parse_env_number("XAPI_MAX_ATTEMPTS")?,
            timeout_ms: parse_env_number("XAPI_TIMEOUT_MS")?,
        })
    }
}

fn parse_env_number<T: FromStr>(env_var: &str) -> Result<Option<T>, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::for_field(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(None),
    }
}

/// An immutable, validated configuration snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Absolute LRS base URL, always ending in `/`
    pub endpoint: Url,

    /// Credentials; `None` only in the placeholder configuration
    pub auth: Option<Auth>,

    /// Value of the `X-Experience-API-Version` header
    pub version: String,

    /// Actor substituted into statements that omit one
    pub actor: Option<Value>,

    /// Delivery attempts per request, including the first
    pub max_attempts: u32,

    /// Timeout applied to each attempt
    pub request_timeout: Duration,
}

impl Default for Config {
    /// The placeholder configuration of an unconfigured wrapper.
    ///
    /// It carries no credentials, so any request built from it fails with a
    /// `ConfigError` until the caller supplies real settings.
    fn default() -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("placeholder endpoint is a valid URL"),
            auth: None,
            version: DEFAULT_VERSION.to_string(),
            actor: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Whether the snapshot carries credentials and can build requests.
    pub fn is_ready(&self) -> bool {
        self.auth.is_some()
    }

    /// Produce a new snapshot with `options` applied over `self`.
    ///
    /// The result is fully validated; `self` is never modified.
    pub fn merged(&self, options: &WrapperOptions) -> Result<Config, ConfigError> {
        let mut next = self.clone();

        if let Some(endpoint) = &options.endpoint {
            next.endpoint = normalize_endpoint(endpoint)?;
        }
        if let Some(auth) = &options.auth {
            next.auth = Some(auth.clone());
        }
        if let Some(version) = &options.version {
            next.version = version.trim().to_string();
        }
        if let Some(actor) = &options.actor {
            next.actor = Some(actor.clone());
        }
        if let Some(max_attempts) = options.max_attempts {
            next.max_attempts = max_attempts;
        }
        if let Some(timeout_ms) = options.timeout_ms {
            if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
                return Err(ConfigError::for_field(
                    "timeoutMs",
                    format!(
                        "timeout {}ms is outside the allowed range ({}..={}ms)",
                        timeout_ms, MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
                    ),
                ));
            }
            next.request_timeout = Duration::from_millis(timeout_ms);
        }

        next.validate()?;
        Ok(next)
    }

    /// Check every invariant a request-building snapshot must satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_endpoint(&self.endpoint)?;
        if !self.endpoint.path().ends_with('/') {
            return Err(ConfigError::for_field("endpoint", "endpoint path must end with '/'"));
        }

        match &self.auth {
            Some(auth) => auth.validate()?,
            None => {
                return Err(ConfigError::for_field(
                    "auth",
                    "credentials are required (basic username/password or bearer token)",
                ))
            }
        }

        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(ConfigError::for_field(
                "version",
                format!(
                    "unsupported xAPI version '{}' (supported: {})",
                    self.version,
                    SUPPORTED_VERSIONS.join(", ")
                ),
            ));
        }

        if let Some(actor) = &self.actor {
            if !actor.is_object() {
                return Err(ConfigError::for_field("actor", "default actor must be a JSON object"));
            }
        }

        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::for_field(
                "maxAttempts",
                format!(
                    "max attempts {} must be between 1 and {}",
                    self.max_attempts, MAX_ATTEMPTS_LIMIT
                ),
            ));
        }

        Ok(())
    }
}

/// Parse and normalise an endpoint so resource paths join beneath it.
fn normalize_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::for_field("endpoint", "endpoint is required"));
    }

    let mut url = Url::parse(raw)
        .map_err(|e| ConfigError::for_field("endpoint", format!("'{}' is not a valid absolute URL: {}", raw, e)))?;
    check_endpoint(&url)?;

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

fn check_endpoint(url: &Url) -> Result<(), ConfigError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::for_field(
            "endpoint",
            format!("unsupported scheme '{}' (expected http or https)", url.scheme()),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::for_field("endpoint", "endpoint must include a host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigError::for_field(
            "endpoint",
            "endpoint must not carry a query string or fragment",
        ));
    }
    Ok(())
}

/// Holds the active configuration snapshot.
///
/// Readers receive an `Arc<Config>`; an update builds and validates a new
/// snapshot and swaps it in only on success.
#[derive(Debug)]
pub struct ConfigurationStore {
    current: RwLock<Arc<Config>>,
}

impl Default for ConfigurationStore {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(Config::default())),
        }
    }
}

impl ConfigurationStore {
    /// A store holding the placeholder configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `options` merged over the defaults and store the result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the endpoint is missing or malformed, the
    /// credentials are absent, or any other option is out of range.
    pub fn initialize(options: &WrapperOptions) -> Result<Self, ConfigError> {
        if options.endpoint.is_none() {
            return Err(ConfigError::for_field("endpoint", "endpoint is required"));
        }

        let config = Config::default().merged(options)?;
        debug!(
            endpoint = %config.endpoint,
            version = %config.version,
            max_attempts = config.max_attempts,
            "Configuration initialized"
        );

        Ok(Self {
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Merge `options` into a new snapshot and publish it.
    ///
    /// On failure the previous snapshot stays active.
    pub fn update(&self, options: &WrapperOptions) -> Result<Arc<Config>, ConfigError> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match guard.merged(options) {
            Ok(next) => {
                let next = Arc::new(next);
                *guard = Arc::clone(&next);
                debug!(endpoint = %next.endpoint, version = %next.version, "Configuration updated");
                Ok(next)
            }
            Err(e) => {
                warn!(error = %e, "Rejected configuration update");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn valid_options() -> WrapperOptions {
        WrapperOptions::new()
            .endpoint("https://lrs.example.com/xapi")
            .basic_auth("key", "secret")
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.endpoint.as_str(), "http://localhost:8080/xapi/");
        assert_eq!(config.version, "1.0.3");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.is_ready());
    }

    #[test]
    fn test_default_store_returns_placeholder() {
        let store = ConfigurationStore::new();
        let config = store.get();
        assert_eq!(*config, Config::default());
    }

    #[test]
    fn test_initialize_normalizes_endpoint() {
        let store = ConfigurationStore::initialize(&valid_options()).expect("valid options");
        let config = store.get();
        assert_eq!(config.endpoint.as_str(), "https://lrs.example.com/xapi/");
        assert!(config.is_ready());
    }

    #[test]
    fn test_validate_checks_stored_endpoint() {
        let mut config = Config::default().merged(&valid_options()).expect("valid options");
        assert_eq!(config.endpoint.path(), "/xapi/");
        assert!(config.validate().is_ok());

        config.endpoint = Url::parse("https://lrs.example.com/xapi").unwrap();
        assert_eq!(config.validate().unwrap_err().field.as_deref(), Some("endpoint"));

        config.endpoint = Url::parse("ftp://lrs.example.com/xapi/").unwrap();
        assert_eq!(config.validate().unwrap_err().field.as_deref(), Some("endpoint"));
    }

    #[test]
    fn test_initialize_requires_endpoint() {
        let options = WrapperOptions::new().bearer_token("abc");
        let err = ConfigurationStore::initialize(&options).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("endpoint"));
    }

    #[test]
    fn test_initialize_rejects_malformed_endpoint() {
        for endpoint in ["", "not a url", "/relative/path", "ftp://lrs.example.com/", "https://lrs.example.com/?x=1"] {
            let options = WrapperOptions::new().endpoint(endpoint).bearer_token("abc");
            let err = ConfigurationStore::initialize(&options).unwrap_err();
            assert_eq!(err.field.as_deref(), Some("endpoint"), "endpoint {:?}", endpoint);
        }
    }

    #[test]
    fn test_initialize_requires_auth() {
        let options = WrapperOptions::new().endpoint("https://lrs.example.com/xapi/");
        let err = ConfigurationStore::initialize(&options).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("auth"));

        let options = options.clone().bearer_token("   ");
        let err = ConfigurationStore::initialize(&options).unwrap_err();
        assert!(err.message.contains("must not be empty"));

        let options = WrapperOptions::new()
            .endpoint("https://lrs.example.com/xapi/")
            .basic_auth("", "secret");
        let err = ConfigurationStore::initialize(&options).unwrap_err();
        assert!(err.message.contains("username"));
    }

    #[test]
    fn test_range_checks() {
        let err = ConfigurationStore::initialize(&valid_options().max_attempts(0)).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("maxAttempts"));

        let err = ConfigurationStore::initialize(&valid_options().max_attempts(11)).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("maxAttempts"));

        let err = ConfigurationStore::initialize(&valid_options().timeout_ms(5)).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("timeoutMs"));

        let err = ConfigurationStore::initialize(&valid_options().version("0.95")).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("version"));

        let err = ConfigurationStore::initialize(&valid_options().actor(json!("someone"))).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("actor"));
    }

    #[test]
    fn test_update_reflects_merge() {
        let store = ConfigurationStore::initialize(&valid_options()).unwrap();
        let actor = json!({"mbox": "mailto:learner@example.com"});

        let updated = store
            .update(&WrapperOptions::new().version("1.0.1").actor(actor.clone()).timeout_ms(2_000))
            .expect("valid update");

        assert_eq!(updated.version, "1.0.1");
        assert_eq!(updated.actor, Some(actor));
        assert_eq!(updated.request_timeout, Duration::from_secs(2));
        // Untouched fields carry over
        assert_eq!(updated.endpoint.as_str(), "https://lrs.example.com/xapi/");
        assert_eq!(updated.auth, Some(Auth::basic("key", "secret")));
        assert_eq!(*store.get(), *updated);
    }

    #[test]
    fn test_rejected_update_keeps_prior_snapshot() {
        let store = ConfigurationStore::initialize(&valid_options()).unwrap();
        let before = store.get();

        let result = store.update(
            &WrapperOptions::new()
                .version("1.0.2")
                .endpoint("definitely not a url"),
        );
        assert!(result.is_err());
        assert_eq!(*store.get(), *before);
    }

    #[test]
    fn test_update_does_not_mutate_held_snapshot() {
        let store = ConfigurationStore::initialize(&valid_options()).unwrap();
        let held = store.get();

        store.update(&WrapperOptions::new().bearer_token("rotated")).unwrap();

        assert_eq!(held.auth, Some(Auth::basic("key", "secret")));
        assert_eq!(store.get().auth, Some(Auth::bearer("rotated")));
    }

    #[test]
    fn test_update_placeholder_requires_full_config() {
        let store = ConfigurationStore::new();
        let err = store
            .update(&WrapperOptions::new().endpoint("https://lrs.example.com/"))
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("auth"));
        assert!(!store.get().is_ready());
    }

    #[test]
    fn test_auth_debug_redacts_secrets() {
        let text = format!("{:?}", Auth::basic("key", "hunter2"));
        assert!(text.contains("key"));
        assert!(!text.contains("hunter2"));

        let text = format!("{:?}", Auth::bearer("tok-123"));
        assert!(!text.contains("tok-123"));
    }

    #[test]
    fn test_options_deserialize_from_json() {
        let options: WrapperOptions = serde_json::from_value(json!({
            "endpoint": "https://lrs.example.com/xapi/",
            "auth": {"username": "key", "password": "secret"},
            "maxAttempts": 5,
            "timeoutMs": 1500
        }))
        .unwrap();
        assert_eq!(options.auth, Some(Auth::basic("key", "secret")));
        assert_eq!(options.max_attempts, Some(5));
        assert_eq!(options.timeout_ms, Some(1500));

        let options: WrapperOptions =
            serde_json::from_value(json!({"auth": {"token": "abc"}})).unwrap();
        assert_eq!(options.auth, Some(Auth::bearer("abc")));
    }

    #[test]
    fn test_options_from_env() {
        let _guard1 = EnvGuard::set("XAPI_ENDPOINT", "https://env.example.com/xapi");
        let _guard2 = EnvGuard::remove("XAPI_TOKEN");
        let _guard3 = EnvGuard::set("XAPI_USERNAME", "env-key");
        let _guard4 = EnvGuard::set("XAPI_PASSWORD", "env-secret");
        let _guard5 = EnvGuard::set("XAPI_MAX_ATTEMPTS", "4");
        let _guard6 = EnvGuard::remove("XAPI_TIMEOUT_MS");
        let _guard7 = EnvGuard::remove("XAPI_VERSION");

        let options = WrapperOptions::from_env().expect("Should load from env");
        assert_eq!(options.endpoint.as_deref(), Some("https://env.example.com/xapi"));
        assert_eq!(options.auth, Some(Auth::basic("env-key", "env-secret")));
        assert_eq!(options.max_attempts, Some(4));
        assert_eq!(options.timeout_ms, None);

        let _guard8 = EnvGuard::set("XAPI_TIMEOUT_MS", "soon");
        let err = WrapperOptions::from_env().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("XAPI_TIMEOUT_MS"));
        assert!(err.message.contains("not a valid number"));
    }
}
