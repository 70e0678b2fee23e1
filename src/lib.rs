//! Mock Simulator
//!
//! A configuration-driven HTTP mock simulation engine. Requests are routed to
//! endpoints by method and path pattern, a response is picked by the
//! endpoint's selection policy, its body optionally rendered from a template,
//! and the answer delayed as configured.
//!
//! # Features
//!
//! - **Path Routing**: `{name}` path variables, first declared endpoint wins
//! - **Request Matching**: Match by header, query param, path variable, body, method, path
//! - **Selection Policies**: Manual (operator-switchable), sequence, conditional
//! - **Dynamic Templates**: `simple` placeholders or Handlebars
//! - **Latency Simulation**: Static and conditional delays
//! - **Hot Reload**: Atomic configuration swaps; invalid documents are rejected
//! - **Observability**: Event stream and bounded request history
//!
//! # Example Configuration
//!
//! ```yaml
//! endpoints:
//!   - pathPattern: /users/{id}
//!     method: GET
//!     selectionPolicy: manual
//!     responses:
//!       - id: found
//!         isDefault: true
//!         bodyTemplate: '{"id": "{{path.id}}"}'
//!       - id: missing
//!         status: 404
//!         body:
//!           error: not_found
//! ```

pub mod config;
pub mod delay;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod listener;
pub mod matcher;
pub mod router;
pub mod selector;
pub mod store;
pub mod template;

pub use config::{Configuration, Endpoint, Response, Rule, SelectionPolicy};
pub use engine::{EngineOptions, MockRequest, MockResponse, ReloadWatcher, SimulationEngine};
pub use error::{SimulatorError, SimulatorResult, TemplateError};
pub use events::{Event, EventKind, Subscription};
pub use history::{HistoryEntry, Outcome};
pub use listener::Listener;
pub use store::{ConfigSource, EmbeddedSource, FileSource};
