//! JSON and CSV rendering of API responses to stdout or an append-mode file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

pub const CSV_UNAVAILABLE: &str = "CSV output not available for this request.";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub file: Option<PathBuf>,
    /// Top-level field of a search response to print; `all` or unset prints
    /// the whole document.
    pub field: Option<String>,
}

impl OutputSpec {
    pub fn selected_field(&self) -> Option<&str> {
        self.field.as_deref().filter(|f| *f != "all")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputError {
    #[error("response has no `{0}` field")]
    MissingField(String),
    #[error("record {index} has no `{key}` field")]
    MissingKey { index: usize, key: &'static str },
}

/// Whether a value was written or the format cannot express it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendered {
    Written,
    Unsupported,
}

pub struct Output<W: Write> {
    spec: OutputSpec,
    sink: W,
}

impl Output<Box<dyn Write>> {
    /// Opens stdout, or the configured file for appending.
    pub fn open(spec: &OutputSpec) -> Result<Self> {
        let sink: Box<dyn Write> = match &spec.file {
            Some(path) => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening {} for append", path.display()))?,
            ),
            None => Box::new(io::stdout()),
        };
        Ok(Self::new(spec.clone(), sink))
    }
}

impl<W: Write> Output<W> {
    pub fn new(spec: OutputSpec, sink: W) -> Self {
        Self { spec, sink }
    }

    /// Search results support both formats and the field selector.
    pub fn search(&mut self, value: &Value) -> Result<Rendered> {
        match self.spec.format {
            OutputFormat::Json => {
                let field = self.spec.selected_field().map(str::to_string);
                write_json(&mut self.sink, value, field.as_deref())?;
            }
            OutputFormat::Csv => {
                write_search_csv(&mut self.sink, value)?;
            }
        }
        Ok(Rendered::Written)
    }

    /// Agents, feed pages and configuration lists are JSON only.
    pub fn resource(&mut self, value: &Value) -> Result<Rendered> {
        match self.spec.format {
            OutputFormat::Json => {
                write_json(&mut self.sink, value, None)?;
                Ok(Rendered::Written)
            }
            OutputFormat::Csv => Ok(Rendered::Unsupported),
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// Writes one compact JSON document followed by a newline.
pub fn write_json<W: Write>(out: &mut W, value: &Value, field: Option<&str>) -> Result<()> {
    let selected = match field {
        Some(name) => value
            .get(name)
            .ok_or_else(|| OutputError::MissingField(name.to_string()))?,
        None => value,
    };
    serde_json::to_writer(&mut *out, selected).context("serializing JSON output")?;
    writeln!(out).context("writing output")?;
    out.flush().context("flushing output")?;
    Ok(())
}

/// One headerless row per record in `data`:
/// timestamp, id, remoteIP, remoteCountryCode, path, tag types, responseCode,
/// agentResponseCode.
pub fn write_search_csv<W: Write>(out: &mut W, value: &Value) -> Result<usize> {
    let rows = value
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| OutputError::MissingField("data".into()))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(&mut *out);
    for (index, row) in rows.iter().enumerate() {
        writer
            .write_record(csv_record(index, row)?)
            .context("writing CSV record")?;
    }
    writer.flush().context("flushing CSV output")?;
    Ok(rows.len())
}

fn csv_record(index: usize, row: &Value) -> Result<[String; 8], OutputError> {
    let field = |key: &'static str| {
        row.get(key)
            .map(value_to_str)
            .ok_or(OutputError::MissingKey { index, key })
    };

    let tags = row
        .get("tags")
        .and_then(Value::as_array)
        .ok_or(OutputError::MissingKey { index, key: "tags" })?
        .iter()
        .map(|tag| {
            tag.get("type")
                .map(value_to_str)
                .ok_or(OutputError::MissingKey { index, key: "type" })
        })
        .collect::<Result<Vec<_>, _>>()?
        .join("|");

    Ok([
        field("timestamp")?,
        field("id")?,
        field("remoteIP")?,
        field("remoteCountryCode")?,
        field("path")?,
        tags,
        field("responseCode")?,
        field("agentResponseCode")?,
    ])
}

fn value_to_str(value: &Value) -> String {
    match value {
        Value::Null => "".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
