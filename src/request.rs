//! Turns an xAPI operation plus a configuration snapshot into a
//! self-contained HTTP request description.
//!
//! A [`RequestDescriptor`] copies everything it needs out of the snapshot
//! (URL, credentials, version header, attempt budget, timeout), so every
//! retry replays exactly what was built at enqueue time even if the
//! configuration is updated in the meantime.

use std::collections::HashSet;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::{Auth, Config};
use crate::error::{ConfigError, Result, ValidationError};
use crate::statement::{Statement, StatementQuery, StateKey};

/// Protocol version header required on every xAPI request
pub const VERSION_HEADER: HeaderName = HeaderName::from_static("x-experience-api-version");

const STATEMENTS_PATH: &str = "statements";
const STATE_PATH: &str = "activities/state";
const ABOUT_PATH: &str = "about";

/// An xAPI call and its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    SendStatement(Statement),
    SendStatements(Vec<Statement>),
    GetStatements(StatementQuery),
    /// Follow the `more` link of a previous statement result
    GetMoreStatements(String),
    SetState { key: StateKey, value: Value },
    GetState(StateKey),
    DeleteState(StateKey),
    About,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::SendStatement(_) => "sendStatement",
            Operation::SendStatements(_) => "sendStatements",
            Operation::GetStatements(_) => "getStatements",
            Operation::GetMoreStatements(_) => "getMoreStatements",
            Operation::SetState { .. } => "setState",
            Operation::GetState(_) => "getState",
            Operation::DeleteState(_) => "deleteState",
            Operation::About => "about",
        }
    }
}

/// A fully-formed request, independent of any later configuration change.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Operation name, for logging
    pub operation: &'static str,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,

    /// Ids of the statements carried in the body, in order
    pub statement_ids: Vec<Uuid>,

    /// Attempt budget taken from the snapshot at build time
    pub max_attempts: u32,

    /// Per-attempt timeout taken from the snapshot at build time
    pub timeout: Duration,
}

/// Builds [`RequestDescriptor`]s against one configuration snapshot.
pub struct RequestBuilder<'a> {
    config: &'a Config,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Validate `operation` and produce the request that carries it.
    ///
    /// # Errors
    ///
    /// - `XapiError::Config` if the snapshot is not usable (for example the
    ///   placeholder configuration without credentials)
    /// - `XapiError::Validation` if the payload is malformed
    pub fn build(&self, operation: Operation) -> Result<RequestDescriptor> {
        self.config.validate()?;
        let base = &self.config.endpoint;
        let name = operation.name();

        let mut statement_ids = Vec::new();
        let (method, url, body) = match operation {
            Operation::SendStatement(statement) => {
                let statement = statement.prepare(self.config.actor.as_ref())?;
                statement_ids.extend(statement.id);
                (Method::POST, join(base, STATEMENTS_PATH)?, Some(to_body(&statement)?))
            }
            Operation::SendStatements(statements) => {
                let prepared = self.prepare_batch(statements)?;
                statement_ids.extend(prepared.iter().filter_map(|s| s.id));
                (Method::POST, join(base, STATEMENTS_PATH)?, Some(to_body(&prepared)?))
            }
            Operation::GetStatements(query) => {
                query.validate()?;
                let mut url = join(base, STATEMENTS_PATH)?;
                append_query(&mut url, query.to_query_pairs());
                (Method::GET, url, None)
            }
            Operation::GetMoreStatements(more) => (Method::GET, resolve_more(base, &more)?, None),
            Operation::SetState { key, value } => {
                key.validate()?;
                let mut url = join(base, STATE_PATH)?;
                append_query(&mut url, key.to_query_pairs());
                (Method::PUT, url, Some(to_body(&value)?))
            }
            Operation::GetState(key) => {
                key.validate()?;
                let mut url = join(base, STATE_PATH)?;
                append_query(&mut url, key.to_query_pairs());
                (Method::GET, url, None)
            }
            Operation::DeleteState(key) => {
                key.validate()?;
                let mut url = join(base, STATE_PATH)?;
                append_query(&mut url, key.to_query_pairs());
                (Method::DELETE, url, None)
            }
            Operation::About => (Method::GET, join(base, ABOUT_PATH)?, None),
        };

        let headers = self.headers(body.is_some())?;

        debug!(
            operation = name,
            method = %method,
            url = %url,
            statements = statement_ids.len(),
            "Built xAPI request"
        );

        Ok(RequestDescriptor {
            operation: name,
            method,
            url,
            headers,
            body,
            statement_ids,
            max_attempts: self.config.max_attempts,
            timeout: self.config.request_timeout,
        })
    }

    fn prepare_batch(&self, statements: Vec<Statement>) -> Result<Vec<Statement>> {
        if statements.is_empty() {
            return Err(ValidationError::for_field("statements", "at least one statement is required").into());
        }

        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(statements.len());
        for (index, statement) in statements.into_iter().enumerate() {
            let statement = statement
                .prepare(self.config.actor.as_ref())
                .map_err(|e| ValidationError {
                    field: Some(format!(
                        "statements[{}].{}",
                        index,
                        e.field.as_deref().unwrap_or("statement")
                    )),
                    message: e.message,
                })?;

            if let Some(id) = statement.id {
                if !seen.insert(id) {
                    return Err(ValidationError::for_field(
                        format!("statements[{}].id", index),
                        format!("duplicate statement id {} in batch", id),
                    )
                    .into());
                }
            }
            prepared.push(statement);
        }
        Ok(prepared)
    }

    fn headers(&self, has_body: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let auth = self
            .config
            .auth
            .as_ref()
            .ok_or_else(|| ConfigError::for_field("auth", "credentials are required"))?;
        let mut authorization = HeaderValue::from_str(&authorization_value(auth))
            .map_err(|_| ConfigError::for_field("auth", "credentials contain characters not allowed in a header"))?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);

        let version = HeaderValue::from_str(&self.config.version)
            .map_err(|_| ConfigError::for_field("version", "not a valid header value"))?;
        headers.insert(VERSION_HEADER, version);

        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if has_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        Ok(headers)
    }
}

/// `Authorization` header value for the configured credentials.
pub fn authorization_value(auth: &Auth) -> String {
    match auth {
        Auth::Basic { username, password } => {
            format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
        }
        Auth::Bearer { token } => format!("Bearer {}", token),
    }
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| ConfigError::for_field("endpoint", format!("cannot resolve '{}': {}", path, e)).into())
}

fn append_query(url: &mut Url, pairs: Vec<(&'static str, String)>) {
    if pairs.is_empty() {
        return;
    }
    let mut query = url.query_pairs_mut();
    for (key, value) in pairs {
        query.append_pair(key, &value);
    }
}

/// Resolve a `more` IRL against the LRS, refusing links to another origin so
/// credentials are never sent elsewhere.
fn resolve_more(base: &Url, more: &str) -> Result<Url> {
    let more = more.trim();
    if more.is_empty() {
        return Err(ValidationError::for_field("more", "more link must not be empty").into());
    }

    let url = base
        .join(more)
        .map_err(|e| ValidationError::for_field("more", format!("'{}' is not a valid link: {}", more, e)))?;

    if url.origin() != base.origin() {
        return Err(ValidationError::for_field("more", "more link points at a different host").into());
    }
    Ok(url)
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| ValidationError::new(format!("cannot serialize payload: {}", e)).into())
}
