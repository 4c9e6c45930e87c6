// sigsci - CLI for the Signal Sciences dashboard API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::output::{OutputFormat, OutputSpec};
use crate::resources::ConfigResource;
use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://dashboard.signalsciences.net";
pub const DEFAULT_API_VERSION: &str = "v0";
pub const DEFAULT_LIMIT: u32 = 100;
pub const FIELD_CHOICES: &[&str] = &["all", "totalCount", "next", "data"];

const ENV_PREFIX: &str = "SIGSCI_";

/// Settings read from YAML config files. Every field is optional; unset
/// fields fall through to built-in defaults.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    pub email: Option<String>,
    pub password: Option<String>,
    pub corp: Option<String>,
    pub site: Option<String>,
    pub base_url: Option<String>,
    pub api_version: Option<String>,
    pub from: Option<String>,
    pub until: Option<String>,
    pub tags: Option<Vec<String>>,
    pub ctags: Option<Vec<String>>,
    pub server: Option<String>,
    pub limit: Option<u32>,
    pub field: Option<String>,
    pub file: Option<PathBuf>,
    pub format: Option<OutputFormat>,
    pub sort: Option<SortOrder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not locate a config directory for the current user")]
    MissingConfigDir,
    #[error(
        "email and password are required; set SIGSCI_EMAIL and SIGSCI_PASSWORD or add them to the config file"
    )]
    MissingCredentials,
    #[error(
        "corp and site are required; set SIGSCI_CORP and SIGSCI_SITE or add them to the config file"
    )]
    MissingCorpSite,
    #[error("invalid value `{value}` for {key} (expected {expected})")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("File must be provided.")]
    MissingFile,
}

/// Account and endpoint identity. Settable from config files and the
/// environment only.
#[derive(Clone, Serialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub email: String,
    pub password: String,
    pub corp: String,
    pub site: String,
    pub base_url: String,
    pub api_version: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("email", &self.email)
            .field("password", &"*****")
            .field("corp", &self.corp)
            .field("site", &self.site)
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.email.trim().is_empty() || self.password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.corp.trim().is_empty() || self.site.trim().is_empty() {
            return Err(ConfigError::MissingCorpSite);
        }
        Ok(())
    }
}

/// Resolved query filters shared by search and feed.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Filters {
    pub from_time: Option<String>,
    pub until_time: Option<String>,
    pub server: Option<String>,
    pub sort: Option<SortOrder>,
    pub tags: Option<Vec<String>>,
    pub ctags: Option<Vec<String>>,
    pub limit: u32,
}

/// Values supplied on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub from: Option<String>,
    pub until: Option<String>,
    pub tags: Option<Vec<String>>,
    pub ctags: Option<Vec<String>>,
    pub server: Option<String>,
    pub limit: Option<u32>,
    pub field: Option<String>,
    pub file: Option<PathBuf>,
    pub format: Option<OutputFormat>,
    pub sort: Option<SortOrder>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub client: ClientConfig,
    pub filters: Filters,
    pub output: OutputSpec,
}

/// The single action a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Search,
    Agents,
    Feed,
    List(ConfigResource),
    Add(ConfigResource),
    Delete(ConfigResource),
}

impl Operation {
    /// Operations selectable by flag, in the order they take precedence.
    pub fn flagged() -> Vec<Operation> {
        let mut ops = vec![Operation::Agents, Operation::Feed];
        for resource in ConfigResource::ALL {
            ops.push(Operation::List(resource));
            ops.push(Operation::Add(resource));
            ops.push(Operation::Delete(resource));
        }
        ops
    }

    /// Environment variable suffix, e.g. `WHITELIST_PATHS_ADD`.
    pub fn env_key(self) -> Option<String> {
        match self {
            Operation::Search => None,
            Operation::Agents => Some("AGENTS".into()),
            Operation::Feed => Some("FEED".into()),
            Operation::List(r) => Some(r.env_stem().into()),
            Operation::Add(r) => Some(format!("{}_ADD", r.env_stem())),
            Operation::Delete(r) => Some(format!("{}_DELETE", r.env_stem())),
        }
    }

    pub fn requires_file(self) -> bool {
        matches!(self, Operation::Add(_) | Operation::Delete(_))
    }
}

/// CLI selection wins; otherwise the first truthy `SIGSCI_<OP>` variable;
/// otherwise a search.
pub fn select_operation<E>(cli: Option<Operation>, env: E) -> Operation
where
    E: Fn(&str) -> Option<String>,
{
    cli.or_else(|| {
        Operation::flagged().into_iter().find(|op| {
            op.env_key()
                .and_then(|key| env_value(&env, &key))
                .is_some_and(|v| is_truthy(&v))
        })
    })
    .unwrap_or(Operation::Search)
}

pub fn config_path<E>(scope: Scope, cwd: &Path, env: E) -> Result<PathBuf>
where
    E: Fn(&str) -> Option<String>,
{
    match scope {
        Scope::Local => Ok(cwd.join(".sigsci.yaml")),
        Scope::User => {
            if let Some(custom) = env_value(&env, "CONFIG_DIR") {
                return Ok(PathBuf::from(custom).join("config.yaml"));
            }
            let base = config_dir().ok_or(ConfigError::MissingConfigDir)?;
            Ok(base.join("sigsci").join("config.yaml"))
        }
    }
}

pub fn load<E>(cwd: &Path, env: E) -> Result<Config>
where
    E: Fn(&str) -> Option<String>,
{
    let user = match config_path(Scope::User, cwd, &env) {
        Ok(path) => read_if_exists(&path)?.unwrap_or_default(),
        Err(err) => {
            debug!(%err, "skipping user config");
            Config::default()
        }
    };
    let local = read_if_exists(&config_path(Scope::Local, cwd, &env)?)?.unwrap_or_default();
    Ok(merge(user, local))
}

/// Layers built-in defaults, config files, `SIGSCI_*` variables and CLI
/// flags, in increasing precedence.
pub fn resolve<E>(cwd: &Path, env: E, cli: CliOverrides) -> Result<ResolvedConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let file = load(cwd, &env)?;

    let client = ClientConfig {
        email: env_value(&env, "EMAIL").or(file.email).unwrap_or_default(),
        password: env_value(&env, "PASSWORD")
            .or(file.password)
            .unwrap_or_default(),
        corp: env_value(&env, "CORP").or(file.corp).unwrap_or_default(),
        site: env_value(&env, "SITE").or(file.site).unwrap_or_default(),
        base_url: env_value(&env, "BASE_URL")
            .or(file.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        api_version: env_value(&env, "API_VERSION")
            .or(file.api_version)
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
    };

    let limit = match cli.limit {
        Some(limit) => Some(limit),
        None => env_value(&env, "LIMIT")
            .map(|raw| {
                raw.trim().parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                    key: "SIGSCI_LIMIT",
                    value: raw,
                    expected: "a positive integer",
                })
            })
            .transpose()?,
    }
    .or(file.limit)
    .unwrap_or(DEFAULT_LIMIT);

    let sort = match cli.sort {
        Some(sort) => Some(sort),
        None => env_value(&env, "SORT").map(|raw| parse_sort(&raw)).transpose()?,
    }
    .or(file.sort);

    let filters = Filters {
        from_time: cli.from.or_else(|| env_value(&env, "FROM")).or(file.from),
        until_time: cli.until.or_else(|| env_value(&env, "UNTIL")).or(file.until),
        server: cli.server.or_else(|| env_value(&env, "SERVER")).or(file.server),
        sort,
        tags: cli
            .tags
            .or_else(|| env_value(&env, "TAGS").map(|raw| split_list(&raw)))
            .or(file.tags),
        ctags: cli
            .ctags
            .or_else(|| env_value(&env, "CTAGS").map(|raw| split_list(&raw)))
            .or(file.ctags),
        limit,
    };

    let format = match cli.format {
        Some(format) => Some(format),
        None => env_value(&env, "FORMAT")
            .map(|raw| parse_format(&raw))
            .transpose()?,
    }
    .or(file.format)
    .unwrap_or_default();

    let field = cli
        .field
        .or_else(|| env_value(&env, "FIELD"))
        .or(file.field);
    if let Some(value) = &field
        && !FIELD_CHOICES.contains(&value.as_str())
    {
        return Err(ConfigError::InvalidValue {
            key: "field",
            value: value.clone(),
            expected: "one of all, totalCount, next, data",
        }
        .into());
    }

    let output = OutputSpec {
        format,
        file: cli
            .file
            .or_else(|| env_value(&env, "FILE").map(PathBuf::from))
            .or(file.file),
        field,
    };

    Ok(ResolvedConfig {
        client,
        filters,
        output,
    })
}

fn env_value<E>(env: &E, key: &str) -> Option<String>
where
    E: Fn(&str) -> Option<String>,
{
    env(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.trim().is_empty())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_sort(raw: &str) -> Result<SortOrder, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "asc" => Ok(SortOrder::Asc),
        "desc" => Ok(SortOrder::Desc),
        _ => Err(ConfigError::InvalidValue {
            key: "SIGSCI_SORT",
            value: raw.to_string(),
            expected: "asc or desc",
        }),
    }
}

fn parse_format(raw: &str) -> Result<OutputFormat, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(OutputFormat::Json),
        "csv" => Ok(OutputFormat::Csv),
        _ => Err(ConfigError::InvalidValue {
            key: "SIGSCI_FORMAT",
            value: raw.to_string(),
            expected: "json or csv",
        }),
    }
}

fn read_if_exists(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let config = serde_yaml::from_str(&contents).with_context(|| format!("parsing {:?}", path))?;
    Ok(Some(config))
}

fn merge(user: Config, local: Config) -> Config {
    Config {
        email: local.email.or(user.email),
        password: local.password.or(user.password),
        corp: local.corp.or(user.corp),
        site: local.site.or(user.site),
        base_url: local.base_url.or(user.base_url),
        api_version: local.api_version.or(user.api_version),
        from: local.from.or(user.from),
        until: local.until.or(user.until),
        tags: local.tags.or(user.tags),
        ctags: local.ctags.or(user.ctags),
        server: local.server.or(user.server),
        limit: local.limit.or(user.limit),
        field: local.field.or(user.field),
        file: local.file.or(user.file),
        format: local.format.or(user.format),
        sort: local.sort.or(user.sort),
    }
}
