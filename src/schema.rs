use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A collection file: saved requests, the workflows chaining them, and the
/// defaults a run starts from.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CollectionFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub requests: Vec<HttpRequest>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

impl CollectionFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read file `{:?}`", path))?;
        serde_yaml::from_str(&content).context("Failed to parse YAML collection")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub collection_id: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub variables: Vec<WorkflowVariable>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WorkflowStep {
    #[serde(default)]
    pub id: String,
    pub request_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract: Vec<VariableExtraction>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WorkflowVariable {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Pulls one named value out of a step's response.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VariableExtraction {
    pub variable: String,
    #[serde(default)]
    pub method: ExtractionMethod,
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Dotted/bracket traversal of the JSON body, e.g. `data.items[0].id`.
    #[default]
    JsonPath,
    /// Response header, matched case-insensitively.
    Header,
    /// Anything this version does not know about. Ignored at extraction time.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }
}

/// A saved request as stored in a collection. Fields may contain `{{name}}`
/// placeholders that are resolved right before the request is sent.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HttpRequest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Overrides `GlobalSettings::timeout_ms` for this request only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HttpRequest {
    pub fn get(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            method: default_method(),
            url: url.into(),
            headers: Vec::new(),
            params: Vec::new(),
            body: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub size: usize,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GlobalSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            proxy: None,
            follow_redirects: true,
            verify_ssl: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}
