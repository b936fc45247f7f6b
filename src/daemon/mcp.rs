//! MCP server config validation and merging.
//!
//! The server name `terry` belongs to the built-in MCP server shipped with
//! the daemon. User configs may not define it, and merging always discards
//! any user entry under that name before the built-in one is (optionally)
//! inserted.

use crate::error::McpConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const RESERVED_SERVER_NAME: &str = "terry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTransport {
    Http,
    Sse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServer {
    /// Launched as a local process.
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Reached over HTTP or SSE.
    Remote {
        #[serde(rename = "type")]
        transport: RemoteTransport,
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, McpServer>,
}

/// Parse and validate a user-supplied config from JSON text.
pub fn parse_mcp_config_str(text: &str) -> Result<McpConfig, McpConfigError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| McpConfigError::InvalidJson(e.to_string()))?;
    parse_mcp_config(&value)
}

/// Validate a user-supplied config. Rejects the reserved name and remote
/// servers that omit `type`.
pub fn parse_mcp_config(value: &Value) -> Result<McpConfig, McpConfigError> {
    let servers = value
        .as_object()
        .and_then(|o| o.get("mcpServers"))
        .and_then(Value::as_object)
        .ok_or(McpConfigError::MissingServers)?;

    let mut mcp_servers = BTreeMap::new();
    for (name, entry) in servers {
        if name == RESERVED_SERVER_NAME {
            return Err(McpConfigError::ReservedName(name.clone()));
        }
        mcp_servers.insert(name.clone(), parse_server(name, entry)?);
    }
    Ok(McpConfig { mcp_servers })
}

fn parse_server(name: &str, entry: &Value) -> Result<McpServer, McpConfigError> {
    let invalid = |reason: &str| McpConfigError::InvalidServer {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    let obj = entry.as_object().ok_or_else(|| invalid("must be an object"))?;
    let env = string_map(obj.get("env")).ok_or_else(|| invalid("\"env\" must map names to strings"))?;

    if let Some(command) = obj.get("command") {
        let command = command
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| invalid("\"command\" must be a non-empty string"))?;
        let args = match obj.get("args") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|a| a.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| invalid("\"args\" must be an array of strings"))?,
            Some(_) => return Err(invalid("\"args\" must be an array of strings")),
        };
        return Ok(McpServer::Command {
            command: command.to_string(),
            args,
            env,
        });
    }

    let Some(url) = obj.get("url") else {
        return Err(invalid("must have either \"command\" or \"url\""));
    };
    let url = url
        .as_str()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| invalid("\"url\" must be a non-empty string"))?;
    let transport = match obj.get("type").map(|t| t.as_str()) {
        None => return Err(McpConfigError::UrlWithoutType(name.to_string())),
        Some(Some("http")) => RemoteTransport::Http,
        Some(Some("sse")) => RemoteTransport::Sse,
        Some(other) => {
            return Err(McpConfigError::UnsupportedType {
                name: name.to_string(),
                kind: other.unwrap_or("<non-string>").to_string(),
            })
        }
    };
    let headers =
        string_map(obj.get("headers")).ok_or_else(|| invalid("\"headers\" must map names to strings"))?;

    Ok(McpServer::Remote {
        transport,
        url: url.to_string(),
        headers,
        env,
    })
}

/// `None` if present but not an object of strings.
fn string_map(value: Option<&Value>) -> Option<BTreeMap<String, String>> {
    match value {
        None | Some(Value::Null) => Some(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        Some(_) => None,
    }
}

/// User servers minus any `terry` entry, plus the built-in `terry` server
/// when `include_terry` is set.
pub fn build_merged_mcp_config(
    user: Option<&McpConfig>,
    include_terry: bool,
    terry_command: &str,
    terry_args: &[String],
) -> McpConfig {
    let mut mcp_servers: BTreeMap<String, McpServer> = user
        .map(|c| c.mcp_servers.clone())
        .unwrap_or_default();
    mcp_servers.remove(RESERVED_SERVER_NAME);

    if include_terry {
        mcp_servers.insert(
            RESERVED_SERVER_NAME.to_string(),
            McpServer::Command {
                command: terry_command.to_string(),
                args: terry_args.to_vec(),
                env: BTreeMap::new(),
            },
        );
    }
    McpConfig { mcp_servers }
}
