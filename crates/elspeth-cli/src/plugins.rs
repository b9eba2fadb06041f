// crates/elspeth-cli/src/plugins.rs
// ============================================================================
// Module: Demo Plugin Set
// Description: A small, fixed set of source/transform/gate/sink
//              implementations used to exercise the engine end to end.
// Purpose: Give the CLI harness something runnable without depending on a
//          real plugin registry, which is explicitly out of scope for
//          elspeth-core.
// Dependencies: elspeth-core
// ============================================================================

//! None of these plugins is meant to be a serious data-processing tool;
//! each is the smallest thing that exercises its trait's contract end to
//! end. Configuration for every plugin is an opaque `serde_json::Value`
//! read directly off its `[[node]]` entry.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::PathBuf;

use elspeth_core::interfaces::BatchTransform;
use elspeth_core::interfaces::Gate;
use elspeth_core::interfaces::OnError;
use elspeth_core::interfaces::RowData;
use elspeth_core::interfaces::Sink;
use elspeth_core::interfaces::Source;
use elspeth_core::interfaces::SourceError;
use elspeth_core::interfaces::SourceRow;
use elspeth_core::interfaces::Transform;
use elspeth_core::interfaces::TransformResult;
use serde_json::Value;

use crate::PluginError;

/// Reads every row from a JSON-lines file into memory up front and streams
/// them back one at a time. Configured with `{"path": "input.jsonl"}`.
pub struct MemorySource {
    rows: Vec<RowData>,
    cursor: usize,
}

impl MemorySource {
    /// Builds a source by eagerly reading `config.path`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if `path` is missing, unreadable, or
    /// contains a line that is not a JSON object.
    pub fn from_config(config: &Value) -> Result<Self, PluginError> {
        let path = config
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::new("memory_source requires a string 'path'"))?;
        let file = File::open(path).map_err(|e| PluginError::new(format!("opening source file '{path}': {e}")))?;
        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| PluginError::new(format!("reading source file '{path}': {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value =
                serde_json::from_str(&line).map_err(|e| PluginError::new(format!("source file '{path}' has invalid JSON: {e}")))?;
            let row = value
                .as_object()
                .cloned()
                .ok_or_else(|| PluginError::new(format!("source file '{path}' line is not a JSON object")))?;
            rows.push(row);
        }
        Ok(Self { rows, cursor: 0 })
    }
}

impl Source for MemorySource {
    fn schema(&self) -> Option<&elspeth_core::core::SchemaContract> {
        None
    }

    fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError> {
        if self.cursor >= self.rows.len() {
            return Ok(None);
        }
        let row = self.rows[self.cursor].clone();
        self.cursor += 1;
        Ok(Some(SourceRow { row, violations: Vec::new() }))
    }
}

/// Emits every input row unchanged.
pub struct PassthroughTransform {
    on_error: OnError,
}

impl PassthroughTransform {
    /// Builds a passthrough transform; its `on_error` policy is always
    /// `Discard` since it never fails.
    #[must_use]
    pub fn from_config(_config: &Value) -> Self {
        Self { on_error: OnError::Discard }
    }
}

impl Transform for PassthroughTransform {
    fn apply(&mut self, row: &RowData) -> TransformResult {
        TransformResult::Success {
            row: row.clone(),
            reason: None,
        }
    }

    fn on_error(&self) -> &OnError {
        &self.on_error
    }
}

/// Upper-cases every string-valued field named in `config.fields` (or
/// every string field, if `fields` is absent).
pub struct UppercaseTransform {
    fields: Option<Vec<String>>,
    on_error: OnError,
}

impl UppercaseTransform {
    /// Builds an uppercase transform from `{"fields": [...]}`.
    #[must_use]
    pub fn from_config(config: &Value) -> Self {
        let fields = config.get("fields").and_then(Value::as_array).map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        });
        Self {
            fields,
            on_error: OnError::Discard,
        }
    }
}

impl Transform for UppercaseTransform {
    fn apply(&mut self, row: &RowData) -> TransformResult {
        let mut out = row.clone();
        for (key, value) in out.iter_mut() {
            if let Some(fields) = &self.fields {
                if !fields.iter().any(|f| f == key) {
                    continue;
                }
            }
            if let Value::String(s) = value {
                *s = s.to_uppercase();
            }
        }
        TransformResult::Success { row: out, reason: None }
    }

    fn on_error(&self) -> &OnError {
        &self.on_error
    }
}

/// Routes a row based on the string value of one field. Configured with
/// `{"field": "status", "routes": {"error": "errors"}, "default": "success"}`.
pub struct FieldGate {
    field: String,
    routes: serde_json::Map<String, Value>,
    default_label: String,
}

impl FieldGate {
    /// Builds a field gate.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if `field` or `default` is missing.
    pub fn from_config(config: &Value) -> Result<Self, PluginError> {
        let field = config
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::new("field_gate requires a string 'field'"))?
            .to_string();
        let default_label = config
            .get("default")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::new("field_gate requires a string 'default'"))?
            .to_string();
        let routes = config
            .get("routes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            field,
            routes,
            default_label,
        })
    }
}

impl Gate for FieldGate {
    fn route(&mut self, row: &RowData) -> Vec<String> {
        let label = row
            .get(&self.field)
            .and_then(Value::as_str)
            .and_then(|v| self.routes.get(v))
            .and_then(Value::as_str)
            .unwrap_or(&self.default_label);
        vec![label.to_string()]
    }
}

/// Summarizes a flushed aggregation batch as a single `{"count": n}` row.
pub struct CountAggregationTransform {
    on_error: OnError,
}

impl CountAggregationTransform {
    /// Builds a count-aggregation batch transform.
    #[must_use]
    pub fn from_config(_config: &Value) -> Self {
        Self { on_error: OnError::Discard }
    }
}

impl BatchTransform for CountAggregationTransform {
    fn apply_batch(&mut self, rows: &[RowData]) -> TransformResult {
        let mut row = serde_json::Map::new();
        row.insert("count".to_string(), Value::from(rows.len() as u64));
        TransformResult::Success { row, reason: None }
    }

    fn on_error(&self) -> &OnError {
        &self.on_error
    }
}

/// Appends each written row as one JSON-lines record. Configured with
/// `{"path": "output.jsonl"}`.
pub struct JsonlSink {
    file: File,
}

impl JsonlSink {
    /// Opens (creating/truncating) the sink's output file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if `path` is missing or cannot be opened.
    pub fn from_config(config: &Value) -> Result<Self, PluginError> {
        let path = config
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::new("jsonl_sink requires a string 'path'"))?;
        let path = PathBuf::from(path);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PluginError::new(format!("opening sink file '{}': {e}", path.display())))?;
        Ok(Self { file })
    }
}

impl Sink for JsonlSink {
    fn schema(&self) -> Option<&elspeth_core::core::SchemaContract> {
        None
    }

    fn write(&mut self, rows: &[RowData]) -> Result<(), String> {
        for row in rows {
            let line = serde_json::to_string(row).map_err(|e| e.to_string())?;
            writeln!(self.file, "{line}").map_err(|e| e.to_string())?;
        }
        self.file.flush().map_err(|e| e.to_string())
    }
}
