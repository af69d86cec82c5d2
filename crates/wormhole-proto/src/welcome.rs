use serde::{Deserialize, Serialize};

/// Greeting payload sent to every freshly connected client.
///
/// All fields are optional on the wire; a non-empty `error` tells peers to
/// disconnect immediately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cli_version: Option<String>,
}
