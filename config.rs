use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    #[default]
    Auto,
    CpuOnly,
    #[serde(rename = "directml_only")]
    DirectMLOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    Disable,
    Basic,
    Extended,
    #[default]
    All,
}

/// Hints passed through to ONNX Runtime when a session is built.
///
/// None of these change what the model computes, only how fast and with how
/// much memory. The struct is hashable because it is half of the session cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub backend: ExecutionBackend,
    #[serde(default)]
    pub device_id: Option<u32>,
    #[serde(default)]
    pub optimization: OptimizationLevel,
    #[serde(default = "default_memory_arena")]
    pub memory_arena: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: ExecutionBackend::Auto,
            device_id: None,
            optimization: OptimizationLevel::All,
            memory_arena: true,
        }
    }
}

impl RuntimeConfig {
    #[cfg(target_os = "windows")]
    pub(crate) fn resolved_device_id(self) -> u32 {
        self.device_id.unwrap_or(0)
    }
}

fn default_memory_arena() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// Class names in the order the model was exported with.
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub labels_path: Option<PathBuf>,
    /// Fallback input name; the name declared by the graph wins.
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default)]
    pub output_name: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            labels: default_labels(),
            labels_path: None,
            input_name: default_input_name(),
            output_name: None,
        }
    }
}

fn default_model_path() -> PathBuf {
    PathBuf::from("model.onnx")
}

fn default_labels() -> Vec<String> {
    ["Glioma", "Meningioma", "Pituitary", "No Tumor"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_input_name() -> String {
    "input".to_string()
}

impl ModelConfig {
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = path.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the class order bound to this model.
    ///
    /// An explicit labels file wins, then a `<stem>.labels.txt` sidecar next to
    /// the model, then the inline list.
    pub fn resolve_labels(&self) -> Result<Vec<String>> {
        let labels = if let Some(path) = &self.labels_path {
            read_labels_file(path)?
        } else if let Some(sidecar) = sidecar_labels_path(&self.model_path) {
            log::info!("Using label order from {}", sidecar.display());
            read_labels_file(&sidecar)?
        } else {
            self.labels.clone()
        };
        validate_labels(&labels)?;
        Ok(labels)
    }
}

fn sidecar_labels_path(model_path: &Path) -> Option<PathBuf> {
    let labels_path = model_path.with_extension("labels.txt");
    if labels_path.is_file() {
        Some(labels_path)
    } else {
        None
    }
}

fn read_labels_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read labels from {}: {e}", path.display()))
    })?;
    let labels: Vec<String> = contents.lines().filter_map(normalize_label).collect();
    if labels.is_empty() {
        return Err(Error::Config(format!(
            "Labels file is empty or invalid: {}",
            path.display()
        )));
    }
    Ok(labels)
}

fn normalize_label(line: &str) -> Option<String> {
    let mut label = line.trim();
    if label.is_empty() || label.starts_with('#') {
        return None;
    }
    if let Some((prefix, rest)) = label.split_once(':') {
        if !prefix.is_empty() && prefix.trim().chars().all(|c| c.is_ascii_digit()) {
            label = rest.trim();
        }
    } else {
        let mut parts = label.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
            label = rest.trim();
        }
    }
    label = label.trim_matches('"').trim_matches('\'');
    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}

fn validate_labels(labels: &[String]) -> Result<()> {
    if labels.is_empty() {
        return Err(Error::Config("At least one class label is required".into()));
    }
    let mut seen = HashSet::new();
    for label in labels {
        if !seen.insert(label.as_str()) {
            return Err(Error::Config(format!("Duplicate class label: {label}")));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// ONNX Runtime shared library to load instead of the platform default.
    #[serde(default)]
    pub runtime_library: Option<PathBuf>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }
}
