//! Payloads of the `initialize` handshake.
//!
//! The client opens with [`InitializeParams`], the server answers with
//! [`InitializeResult`], and the client closes the exchange with an
//! `notifications/initialized` notification carrying no params.

use crate::capabilities::Capabilities;
use serde::{Deserialize, Serialize};

use super::Implementation;

/// Params of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version the client wants to speak
    pub protocol_version: String,

    /// Capabilities the client declares
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Client identity
    pub client_info: Implementation,
}

impl InitializeParams {
    /// Create initialize params.
    pub fn new(
        protocol_version: impl Into<String>,
        capabilities: Capabilities,
        client_info: Implementation,
    ) -> Self {
        Self {
            protocol_version: protocol_version.into(),
            capabilities,
            client_info,
        }
    }
}

/// Result of the `initialize` request.
///
/// Fixed once the handshake completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol version the server selected
    pub protocol_version: String,

    /// Capabilities the server declares
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Server identity
    pub server_info: Implementation,

    /// Free-text usage hints for the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Create an initialize result without instructions.
    pub fn new(
        protocol_version: impl Into<String>,
        capabilities: Capabilities,
        server_info: Implementation,
    ) -> Self {
        Self {
            protocol_version: protocol_version.into(),
            capabilities,
            server_info,
            instructions: None,
        }
    }

    /// Attach instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initialize_params_wire_shape() {
        let params = InitializeParams::new(
            "2024-11-05",
            Capabilities::new().with("sampling", json!({})),
            Implementation::new("probe", "0.1.0"),
        );
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"sampling": {}},
                "clientInfo": {"name": "probe", "version": "0.1.0"}
            })
        );
    }

    #[test]
    fn test_initialize_result_omits_missing_instructions() {
        let result = InitializeResult::new(
            "2024-11-05",
            Capabilities::default(),
            Implementation::new("srv", "1.0.0"),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("instructions").is_none());

        let with = result.with_instructions("Use tools carefully");
        let parsed: InitializeResult =
            serde_json::from_value(serde_json::to_value(&with).unwrap()).unwrap();
        assert_eq!(parsed.instructions.as_deref(), Some("Use tools carefully"));
    }
}
