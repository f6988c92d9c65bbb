//! Public facade over configuration, request building and delivery.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::{Config, ConfigurationStore, WrapperOptions};
use crate::error::{ConfigError, Result};
use crate::queue::{Backoff, DeliveryHandle, DeliveryQueue, QueueStats};
use crate::request::{Operation, RequestBuilder};
use crate::statement::{Statement, StatementQuery, StateKey};
use crate::transport::{HttpTransport, Transport};

/// xAPI client wrapper.
///
/// Each request method validates its input and builds the request against
/// the current configuration snapshot synchronously, then queues it and
/// returns a [`DeliveryHandle`]. Requests from one wrapper reach the LRS in
/// the order they were submitted.
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use xapi_wrapper::{Statement, WrapperOptions, XapiWrapper};
///
/// #[tokio::main]
/// async fn main() -> Result<(), xapi_wrapper::XapiError> {
///     let wrapper = XapiWrapper::with_options(
///         WrapperOptions::new()
///             .endpoint("https://lrs.example.com/xapi/")
///             .basic_auth("key", "secret"),
///     )?;
///
///     let statement = Statement::new(
///         json!({"mbox": "mailto:learner@example.com"}),
///         json!({"id": "http://adlnet.gov/expapi/verbs/completed"}),
///         json!({"id": "http://example.com/activities/intro"}),
///     );
///     let delivery = wrapper.send_statement(statement)?.await?;
///     println!("stored {:?}", delivery.statement_ids);
///     Ok(())
/// }
/// ```
pub struct XapiWrapper {
    config: ConfigurationStore,
    queue: DeliveryQueue,
}

impl Default for XapiWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl XapiWrapper {
    /// A wrapper holding the placeholder configuration.
    ///
    /// [`get_config`](Self::get_config) works immediately; requests fail with
    /// a `ConfigError` until credentials and an endpoint are supplied through
    /// [`update_config`](Self::update_config).
    pub fn new() -> Self {
        Self {
            config: ConfigurationStore::new(),
            queue: DeliveryQueue::new(Arc::new(HttpTransport::default()), Backoff::default()),
        }
    }

    /// A wrapper configured from `options` merged over the defaults.
    ///
    /// # Errors
    ///
    /// Returns `XapiError::Config` if the options do not form a usable
    /// configuration, or `XapiError::Runtime` if the HTTP client cannot be
    /// built.
    pub fn with_options(options: WrapperOptions) -> Result<Self> {
        let transport = HttpTransport::new()?;
        Self::with_transport(options, Arc::new(transport), Backoff::default())
    }

    /// A wrapper using a caller-supplied transport and backoff policy.
    pub fn with_transport(
        options: WrapperOptions,
        transport: Arc<dyn Transport>,
        backoff: Backoff,
    ) -> Result<Self> {
        let config = ConfigurationStore::initialize(&options)?;
        Ok(Self {
            config,
            queue: DeliveryQueue::new(transport, backoff),
        })
    }

    /// The current configuration snapshot. Never empty.
    pub fn get_config(&self) -> Arc<Config> {
        self.config.get()
    }

    /// Merge `options` into a new configuration snapshot.
    ///
    /// Requests already queued keep the snapshot they were built with.
    pub fn update_config(&self, options: WrapperOptions) -> std::result::Result<Arc<Config>, ConfigError> {
        self.config.update(&options)
    }

    pub fn send_statement(&self, statement: Statement) -> Result<DeliveryHandle> {
        self.submit(Operation::SendStatement(statement))
    }

    pub fn send_statements(&self, statements: Vec<Statement>) -> Result<DeliveryHandle> {
        self.submit(Operation::SendStatements(statements))
    }

    pub fn get_statements(&self, query: StatementQuery) -> Result<DeliveryHandle> {
        self.submit(Operation::GetStatements(query))
    }

    /// Fetch the next page named by a statement result's `more` link.
    pub fn get_more_statements(&self, more: impl Into<String>) -> Result<DeliveryHandle> {
        self.submit(Operation::GetMoreStatements(more.into()))
    }

    pub fn set_state(
        &self,
        activity_id: impl Into<String>,
        agent: Value,
        state_id: impl Into<String>,
        value: Value,
    ) -> Result<DeliveryHandle> {
        self.set_state_document(StateKey::new(activity_id, agent, state_id), value)
    }

    pub fn get_state(
        &self,
        activity_id: impl Into<String>,
        agent: Value,
        state_id: impl Into<String>,
    ) -> Result<DeliveryHandle> {
        self.get_state_document(StateKey::new(activity_id, agent, state_id))
    }

    /// Store a state document addressed by a full key (including registration).
    pub fn set_state_document(&self, key: StateKey, value: Value) -> Result<DeliveryHandle> {
        self.submit(Operation::SetState { key, value })
    }

    pub fn get_state_document(&self, key: StateKey) -> Result<DeliveryHandle> {
        self.submit(Operation::GetState(key))
    }

    pub fn delete_state(&self, key: StateKey) -> Result<DeliveryHandle> {
        self.submit(Operation::DeleteState(key))
    }

    /// Ask the LRS which xAPI versions it supports.
    pub fn about(&self) -> Result<DeliveryHandle> {
        self.submit(Operation::About)
    }

    /// Requests queued or in flight.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Wait until every submitted request has resolved.
    pub async fn drain(&self) {
        self.queue.drain().await
    }

    fn submit(&self, operation: Operation) -> Result<DeliveryHandle> {
        let config = self.config.get();
        let request = RequestBuilder::new(&config).build(operation)?;
        let handle = self.queue.enqueue(request)?;
        debug!(
            entry_id = %handle.id(),
            operation = handle.operation(),
            pending = self.queue.len(),
            "Submitted request"
        );
        Ok(handle)
    }
}
