//! xAPI Wrapper Library
//!
//! A client for recording and retrieving Experience API (xAPI) statements
//! and state documents against a Learning Record Store (LRS):
//!
//! - **config**: Validated, immutable connection configuration snapshots
//! - **statement**: Statement, query and state-document shapes
//! - **request**: Builds self-contained, authenticated HTTP requests
//! - **transport**: HTTP exchange and outcome classification
//! - **queue**: Ordered delivery with retry and exponential backoff
//! - **wrapper**: The public facade composing all of the above
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use xapi_wrapper::{Statement, StatementQuery, WrapperOptions, XapiWrapper};
//!
//! #[tokio::main]
//! async fn main() {
//!     let wrapper = XapiWrapper::with_options(
//!         WrapperOptions::new()
//!             .endpoint("https://lrs.example.com/xapi/")
//!             .bearer_token("token"),
//!     )
//!     .expect("Failed to configure wrapper");
//!
//!     let statement = Statement::new(
//!         json!({"mbox": "mailto:learner@example.com"}),
//!         json!({"id": "http://adlnet.gov/expapi/verbs/completed"}),
//!         json!({"id": "http://example.com/activities/intro"}),
//!     );
//!     wrapper.send_statement(statement).expect("valid statement").await.ok();
//!
//!     let page = wrapper
//!         .get_statements(StatementQuery::new().limit(10))
//!         .expect("valid query")
//!         .await;
//!     println!("{:?}", page.map(|d| d.response.body));
//! }
//! ```

// Module declarations
pub mod config;
pub mod error;
pub mod queue;
pub mod request;
pub mod statement;
pub mod transport;
pub mod wrapper;

// Re-export commonly used types at crate root for convenience
pub use config::{Auth, Config, ConfigurationStore, WrapperOptions};
pub use error::{ConfigError, DeliveryFailure, Result, ValidationError, XapiError};
pub use queue::{Backoff, Delivery, DeliveryHandle, DeliveryQueue, EntryStatus, QueueStats};
pub use request::{Operation, RequestBuilder, RequestDescriptor};
pub use statement::{Statement, StatementFormat, StatementQuery, StateKey};
pub use transport::{HttpTransport, LrsResponse, Outcome, Transport};
pub use wrapper::XapiWrapper;
