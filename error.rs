use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image could not be decoded: {0}")]
    Decode(String),

    #[error("Model could not be loaded from {}: {reason}", .path.display())]
    ModelLoad { path: PathBuf, reason: String },

    #[error("Inference Failed: {0}")]
    Inference(String),

    #[error("Malformed model output: expected {expected} values, got {actual}")]
    MalformedOutput { expected: usize, actual: usize },

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Pipeline position used to report where an analysis stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Preprocessing,
    Loading,
    Running,
    Postprocessing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preprocessing => "preprocessing",
            Self::Loading => "model loading",
            Self::Running => "inference",
            Self::Postprocessing => "postprocessing",
        };
        f.write_str(name)
    }
}

/// The single failure the orchestrator hands back to its caller.
#[derive(Debug, Error)]
#[error("Analysis failed during {stage}: {source}")]
pub struct AnalysisFailed {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl AnalysisFailed {
    pub fn at(stage: Stage, source: Error) -> Self {
        Self { stage, source }
    }

    /// Short reason suitable for showing to the person who submitted the scan.
    pub fn reason(&self) -> String {
        match &self.source {
            Error::Decode(_) => {
                "The selected file is not a readable JPEG, PNG or bitmap image.".to_string()
            }
            Error::ModelLoad { path, .. } => format!(
                "The classification model could not be loaded from {}.",
                path.display()
            ),
            Error::MalformedOutput { expected, actual } => format!(
                "The model returned {actual} scores but {expected} class labels are configured."
            ),
            other => other.to_string(),
        }
    }
}
