//! Capability sets and the checks that gate methods on them.
//!
//! A [`Capabilities`] value maps a feature area (`tools`, `resources`,
//! `prompts`, `sampling`, `roots`, `logging`, ...) to its sub-options. An area
//! counts as declared when its entry is present and is neither `null` nor
//! `false`; an empty object `{}` is a declaration.
//!
//! The three `assert_*` functions hold no state. Each maps a method name to
//! the area it needs through a static table and checks one capability set.
//! Methods missing from the tables are always allowed so that newer peers can
//! introduce methods this library does not know about.
//!
//! ```rust
//! use mcp_duplex::capabilities::{assert_request_handler_capability, Capabilities, Side};
//! use serde_json::json;
//!
//! let local = Capabilities::new().with("tools", json!({}));
//! assert!(assert_request_handler_capability("tools/call", &local, Side::Server).is_ok());
//! assert!(assert_request_handler_capability("prompts/get", &local, Side::Server).is_err());
//! ```

use crate::error::ValidationError;
use crate::messages::methods;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Nested mapping of feature area to sub-options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    /// An empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of one area.
    pub fn with(mut self, area: impl Into<String>, options: Value) -> Self {
        self.0.insert(area.into(), options);
        self
    }

    /// Whether `area` is declared.
    pub fn has(&self, area: &str) -> bool {
        !matches!(self.0.get(area), None | Some(Value::Null) | Some(Value::Bool(false)))
    }

    /// Sub-options of `area`, if present.
    pub fn get(&self, area: &str) -> Option<&Value> {
        self.0.get(area)
    }

    /// Whether no area is declared at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Widen this set with `additional`; nothing already declared is removed.
    pub fn merge(&mut self, additional: &Capabilities) {
        merge_objects(&mut self.0, &additional.0);
    }

    /// Borrow the underlying JSON map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Capabilities {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Merge `additional` into a copy of `base`.
///
/// Object-valued entries are merged key by key, recursively; any other value
/// in `additional` replaces the one in `base`.
pub fn merge_capabilities(base: &Capabilities, additional: &Capabilities) -> Capabilities {
    let mut merged = base.clone();
    merged.merge(additional);
    merged
}

fn merge_objects(target: &mut Map<String, Value>, additional: &Map<String, Value>) {
    for (key, value) in additional {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(extra)) => merge_objects(existing, extra),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Which role owns the capability set being checked.
///
/// Only used to word the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The client role
    Client,
    /// The server role
    Server,
}

impl Side {
    /// The role on the other end of the connection.
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("Client"),
            Side::Server => f.write_str("Server"),
        }
    }
}

/// Area a request method needs, on the side that answers it.
pub fn capability_for_request(method: &str) -> Option<&'static str> {
    match method {
        methods::SAMPLING_CREATE_MESSAGE => Some("sampling"),
        methods::ROOTS_LIST => Some("roots"),
        methods::LOGGING_SET_LEVEL => Some("logging"),
        methods::PROMPTS_GET | methods::PROMPTS_LIST | methods::COMPLETION_COMPLETE => {
            Some("prompts")
        }
        methods::RESOURCES_LIST
        | methods::RESOURCES_TEMPLATES_LIST
        | methods::RESOURCES_READ
        | methods::RESOURCES_SUBSCRIBE
        | methods::RESOURCES_UNSUBSCRIBE => Some("resources"),
        methods::TOOLS_CALL | methods::TOOLS_LIST => Some("tools"),
        _ => None,
    }
}

/// Area a notification method needs, on the side that emits it.
pub fn capability_for_notification(method: &str) -> Option<&'static str> {
    match method {
        methods::NOTIFICATION_MESSAGE => Some("logging"),
        methods::NOTIFICATION_RESOURCES_UPDATED | methods::NOTIFICATION_RESOURCES_LIST_CHANGED => {
            Some("resources")
        }
        methods::NOTIFICATION_TOOLS_LIST_CHANGED => Some("tools"),
        methods::NOTIFICATION_PROMPTS_LIST_CHANGED => Some("prompts"),
        methods::NOTIFICATION_ROOTS_LIST_CHANGED => Some("roots"),
        _ => None,
    }
}

fn require(
    area: Option<&'static str>,
    method: &str,
    capabilities: &Capabilities,
    side: Side,
) -> Result<(), ValidationError> {
    match area {
        Some(area) if !capabilities.has(area) => Err(ValidationError::MissingCapability {
            role: side.to_string(),
            capability: area.to_string(),
            method: method.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Check, before issuing a request, that the peer declared what `method`
/// needs. Only consulted in strict mode.
pub fn assert_capability_for_method(
    method: &str,
    peer_capabilities: &Capabilities,
    peer: Side,
) -> Result<(), ValidationError> {
    require(capability_for_request(method), method, peer_capabilities, peer)
}

/// Check, before emitting a notification, that this side declared what
/// `method` needs.
pub fn assert_notification_capability(
    method: &str,
    local_capabilities: &Capabilities,
    local: Side,
) -> Result<(), ValidationError> {
    require(
        capability_for_notification(method),
        method,
        local_capabilities,
        local,
    )
}

/// Check, when registering a handler, that this side declared what `method`
/// needs.
pub fn assert_request_handler_capability(
    method: &str,
    local_capabilities: &Capabilities,
    local: Side,
) -> Result<(), ValidationError> {
    require(capability_for_request(method), method, local_capabilities, local)
}
