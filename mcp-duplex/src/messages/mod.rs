//! Wire message types.
//!
//! - [`core`]: JSON-RPC request/response/notification envelopes, error codes,
//!   and the classification rule for inbound payloads
//! - [`initialization`]: the `initialize` handshake payloads
//! - [`notifications`]: built-in `notifications/cancelled` and
//!   `notifications/progress` payloads
//! - [`logging`], [`prompts`], [`resources`], [`sampling`], [`tools`]: params
//!   for the role convenience methods
//!
//! Method names live in [`methods`] so the capability table, the engine, and
//! the roles agree on spelling.

pub mod core;
pub mod initialization;
pub mod logging;
pub mod notifications;
pub mod prompts;
pub mod resources;
pub mod sampling;
pub mod tools;

pub use self::core::*;
pub use initialization::*;
pub use logging::{LoggingLevel, LoggingMessageParams, SetLevelParams};
pub use notifications::{CancelledParams, Progress, ProgressParams};
pub use prompts::GetPromptParams;
pub use resources::{ReadResourceParams, ResourceUpdatedParams, SubscribeParams};
pub use sampling::{CompleteParams, CreateMessageParams, SamplingMessage};
pub use tools::CallToolParams;

use serde::{Deserialize, Serialize};

/// JSON-RPC version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Newest protocol revision this library speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2024-11-05";

/// Every protocol revision the server role will echo back unchanged.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[LATEST_PROTOCOL_VERSION, "2024-10-07"];

/// Method names used by the engine and the roles.
pub mod methods {
    #![allow(missing_docs)]

    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const ROOTS_LIST: &str = "roots/list";

    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    /// Legacy spelling of the ready signal, still accepted by the server role.
    pub const NOTIFICATION_INITIALIZED_LEGACY: &str = "initialized";
    pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIFICATION_PROGRESS: &str = "notifications/progress";
    pub const NOTIFICATION_MESSAGE: &str = "notifications/message";
    pub const NOTIFICATION_RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const NOTIFICATION_ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
}

/// Name and version of a client or server implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Name of the implementation
    pub name: String,

    /// Version of the implementation
    pub version: String,
}

impl Implementation {
    /// Create a new implementation info structure.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Params shared by every paginated `*/list` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginatedParams {
    /// Opaque cursor returned by the previous page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl PaginatedParams {
    /// Params for the page after `cursor`.
    pub fn after(cursor: impl Into<String>) -> Self {
        Self {
            cursor: Some(cursor.into()),
        }
    }
}
