//! Site configuration lists (whitelists, blacklist, redactions) and the
//! batch add/delete operations that replay an exported list file.

use crate::client::{ApiError, DashboardClient, Session};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::{fs, path::Path};
use tracing::{info, warn};

/// Fields assigned by the dashboard that must not be sent back on create.
const SERVER_ASSIGNED: &[&str] = &["created", "createdBy", "id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigResource {
    ParamWhitelist,
    PathWhitelist,
    Whitelist,
    Blacklist,
    Redactions,
}

impl ConfigResource {
    pub const ALL: [ConfigResource; 5] = [
        ConfigResource::ParamWhitelist,
        ConfigResource::PathWhitelist,
        ConfigResource::Whitelist,
        ConfigResource::Blacklist,
        ConfigResource::Redactions,
    ];

    /// Path segment under `corps/<corp>/sites/<site>/`.
    pub fn endpoint(self) -> &'static str {
        match self {
            ConfigResource::ParamWhitelist => "paramwhitelist",
            ConfigResource::PathWhitelist => "pathwhitelist",
            ConfigResource::Whitelist => "whitelist",
            ConfigResource::Blacklist => "blacklist",
            ConfigResource::Redactions => "redactions",
        }
    }

    pub fn env_stem(self) -> &'static str {
        match self {
            ConfigResource::ParamWhitelist => "WHITELIST_PARAMETERS",
            ConfigResource::PathWhitelist => "WHITELIST_PATHS",
            ConfigResource::Whitelist => "WHITELIST",
            ConfigResource::Blacklist => "BLACKLIST",
            ConfigResource::Redactions => "REDACTIONS",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConfigResource::ParamWhitelist => "whitelist parameters",
            ConfigResource::PathWhitelist => "whitelist paths",
            ConfigResource::Whitelist => "IP whitelist",
            ConfigResource::Blacklist => "IP blacklist",
            ConfigResource::Redactions => "redactions",
        }
    }
}

/// Reads a list export: a JSON object whose `data` field is an array of
/// entry objects.
pub fn load_entries(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parsing {} as JSON", path.display()))?;
    entries_from(doc).with_context(|| format!("reading entries from {}", path.display()))
}

fn entries_from(doc: Value) -> Result<Vec<Map<String, Value>>, ApiError> {
    let Value::Object(mut root) = doc else {
        return Err(ApiError::MalformedBatch("top level is not an object".into()));
    };
    let Some(Value::Array(items)) = root.remove("data") else {
        return Err(ApiError::MalformedBatch("missing `data` array".into()));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            Value::Object(map) => Ok(map),
            _ => Err(ApiError::MalformedBatch(format!(
                "entry {idx} is not an object"
            ))),
        })
        .collect()
}

/// Creates every entry in order, stopping at the first one the API rejects.
pub fn add_entries(
    client: &DashboardClient,
    session: &Session,
    resource: ConfigResource,
    entries: Vec<Map<String, Value>>,
) -> Result<usize> {
    let mut created = 0;
    for mut entry in entries {
        for key in SERVER_ASSIGNED {
            entry.remove(*key);
        }
        let body = Value::Object(entry);
        match client.post_entry(session, resource.endpoint(), &body) {
            Ok(_) => created += 1,
            Err(err) => {
                let entry = serde_json::to_string(&body).unwrap_or_default();
                return Err(match err.downcast::<ApiError>() {
                    Ok(ApiError::Api { message }) => ApiError::BatchEntry { message, entry }.into(),
                    Ok(other) => other.into(),
                    Err(other) => other.context(format!("Data: {entry}")),
                });
            }
        }
    }
    info!(resource = resource.label(), created, "batch add complete");
    Ok(created)
}

/// Deletes every entry by its `id`, one request per entry at
/// `<endpoint>/<id>`.
pub fn delete_entries(
    client: &DashboardClient,
    session: &Session,
    resource: ConfigResource,
    entries: Vec<Map<String, Value>>,
) -> Result<usize> {
    let mut deleted = 0;
    for entry in entries {
        let id = entry_id(&entry)?;
        client.delete_entry(session, resource.endpoint(), &id)?;
        deleted += 1;
    }
    info!(resource = resource.label(), deleted, "batch delete complete");
    Ok(deleted)
}

/// Updating list entries has no known API contract; this issues no request.
#[allow(dead_code)]
pub fn update_entries(
    _client: &DashboardClient,
    _session: &Session,
    resource: ConfigResource,
    _entries: Vec<Map<String, Value>>,
) -> Result<usize> {
    warn!(
        resource = resource.label(),
        "updating entries is not supported; nothing was sent"
    );
    Ok(0)
}

fn entry_id(entry: &Map<String, Value>) -> Result<String, ApiError> {
    match entry.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(ApiError::MalformedBatch(format!(
            "entry without an `id`: {}",
            serde_json::to_string(entry).unwrap_or_default()
        ))),
    }
}
