//! Local brain MRI classification.
//!
//! A scan goes through [`preprocess::encode`] into a `[1, 3, 224, 224]` tensor,
//! through a cached ONNX Runtime session, and through [`decision::decide`] into
//! a [`ClassificationResult`]. [`Analyzer`] ties the stages together and turns
//! every failure into a single [`AnalysisFailed`].

pub mod analyzer;
pub mod config;
pub mod decision;
pub mod error;
pub mod models;
pub mod onnx;
pub mod preprocess;

pub use crate::analyzer::Analyzer;
pub use crate::config::{ExecutionBackend, ModelConfig, OptimizationLevel, RuntimeConfig, Settings};
pub use crate::error::{AnalysisFailed, Error, Result, Stage};
pub use crate::models::{AnalysisOutcome, ClassificationResult};
pub use crate::onnx::{ClassifierModel, ModelLoader, OrtLoader, SessionCache, TensorBinding};
pub use crate::preprocess::InputTensor;
