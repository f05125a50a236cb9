use crate::config::{ExecutionBackend, ModelConfig, OptimizationLevel, RuntimeConfig};
use crate::error::{Error, Result};
use crate::preprocess::{InputTensor, INPUT_SHAPE};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{TensorRef, ValueType};

#[cfg(target_os = "windows")]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceProvider {
    Cpu,
    DirectML { device_id: u32 },
}

impl InferenceProvider {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::DirectML { .. } => "GPU (DirectML)",
        }
    }
}

impl From<OptimizationLevel> for GraphOptimizationLevel {
    fn from(level: OptimizationLevel) -> Self {
        match level {
            OptimizationLevel::Disable => GraphOptimizationLevel::Disable,
            OptimizationLevel::Basic => GraphOptimizationLevel::Level1,
            OptimizationLevel::Extended => GraphOptimizationLevel::Level2,
            OptimizationLevel::All => GraphOptimizationLevel::Level3,
        }
    }
}

/// Tensor names a loaded model is bound to, as declared by the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorBinding {
    pub input: String,
    pub output: String,
    pub provider: InferenceProvider,
}

/// A loaded classifier that maps one input tensor to one logit vector.
pub trait ClassifierModel: Send {
    fn binding(&self) -> &TensorBinding;

    fn run(&mut self, input: &InputTensor) -> Result<Vec<f32>>;
}

/// Creates sessions for a model artifact. Production code uses [`OrtLoader`].
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        model: &ModelConfig,
        runtime: RuntimeConfig,
        class_count: usize,
    ) -> Result<Box<dyn ClassifierModel>>;
}

impl<L: ModelLoader + ?Sized> ModelLoader for Arc<L> {
    fn load(
        &self,
        model: &ModelConfig,
        runtime: RuntimeConfig,
        class_count: usize,
    ) -> Result<Box<dyn ClassifierModel>> {
        (**self).load(model, runtime, class_count)
    }
}

/// Loads models through ONNX Runtime.
///
/// ONNX Runtime keeps one environment per process. It is committed on the
/// first load; a `runtime_library` given to a later loader has no effect.
#[derive(Debug, Clone, Default)]
pub struct OrtLoader {
    runtime_library: Option<PathBuf>,
}

impl OrtLoader {
    pub fn new(runtime_library: Option<PathBuf>) -> Self {
        Self { runtime_library }
    }
}

impl ModelLoader for OrtLoader {
    fn load(
        &self,
        model: &ModelConfig,
        runtime: RuntimeConfig,
        class_count: usize,
    ) -> Result<Box<dyn ClassifierModel>> {
        let path = model.model_path.as_path();
        if !path.is_file() {
            return Err(Error::model_load(path, "model artifact not found at configured path"));
        }
        ensure_environment(self.runtime_library.as_deref())
            .map_err(|e| Error::model_load(path, e))?;
        let (session, provider) = build_session(path, runtime)?;
        let binding = bind_session(&session, model, provider, class_count)?;
        log::info!(
            "Loaded model {} on {} (input '{}', output '{}')",
            path.display(),
            provider.label(),
            binding.input,
            binding.output
        );
        Ok(Box::new(OrtClassifier { session, binding }))
    }
}

struct OrtClassifier {
    session: Session,
    binding: TensorBinding,
}

impl ClassifierModel for OrtClassifier {
    fn binding(&self) -> &TensorBinding {
        &self.binding
    }

    fn run(&mut self, input: &InputTensor) -> Result<Vec<f32>> {
        let session = &mut self.session;
        let binding = &self.binding;
        let forward = || -> Result<Vec<f32>> {
            let tensor = TensorRef::from_array_view(input.as_array().view())
                .map_err(|e| Error::Inference(format!("Invalid input tensor: {e}")))?;
            let outputs = session
                .run(ort::inputs![binding.input.as_str() => tensor])
                .map_err(|e| Error::Inference(format!("Failed to run model: {e}")))?;
            let output = outputs.get(binding.output.as_str()).ok_or_else(|| {
                Error::Inference(format!("Model produced no output named '{}'", binding.output))
            })?;
            let (_, data) = output.try_extract_tensor::<f32>().map_err(|e| {
                Error::Inference(format!("Failed to read output '{}' as f32: {e}", binding.output))
            })?;
            Ok(data.to_vec())
        };
        match catch_unwind(AssertUnwindSafe(forward)) {
            Ok(res) => res,
            Err(_) => Err(Error::Inference("ONNX Runtime panicked during the forward pass".into())),
        }
    }
}

fn ensure_environment(runtime_library: Option<&Path>) -> std::result::Result<(), String> {
    let builder = match runtime_library {
        Some(path) => ort::init_from(path.display().to_string()),
        None => ort::init(),
    };
    let committed = builder
        .with_name("btcs-inference")
        .commit()
        .map_err(|e| format!("Failed to init ORT environment: {e}"))?;
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
    }
    Ok(())
}

fn build_session(model_path: &Path, cfg: RuntimeConfig) -> Result<(Session, InferenceProvider)> {
    let load_err = |e: &dyn std::fmt::Display| Error::model_load(model_path, e);

    let try_build = |use_dml: bool| -> Result<Session> {
        let build = || -> Result<Session> {
            let mut builder = Session::builder()
                .map_err(|e| load_err(&e))?
                .with_optimization_level(cfg.optimization.into())
                .map_err(|e| load_err(&e))?
                .with_parallel_execution(false)
                .map_err(|e| load_err(&e))?;
            if use_dml {
                #[cfg(target_os = "windows")]
                {
                    builder = builder.with_memory_pattern(false).map_err(|e| load_err(&e))?;
                    let ep = DirectMLExecutionProvider::default()
                        .with_device_id(cfg.resolved_device_id() as i32)
                        .build();
                    builder = builder
                        .with_execution_providers([ep])
                        .map_err(|e| load_err(&e))?;
                }
            } else {
                let ep = CPUExecutionProvider::default()
                    .with_arena_allocator(cfg.memory_arena)
                    .build();
                builder = builder
                    .with_memory_pattern(cfg.memory_arena)
                    .map_err(|e| load_err(&e))?
                    .with_execution_providers([ep])
                    .map_err(|e| load_err(&e))?;
            }
            builder.commit_from_file(model_path).map_err(|e| load_err(&e))
        };
        match catch_unwind(AssertUnwindSafe(build)) {
            Ok(res) => res,
            Err(_) => Err(Error::model_load(
                model_path,
                "ONNX Runtime panicked while building session",
            )),
        }
    };

    let wants_dml = matches!(
        cfg.backend,
        ExecutionBackend::Auto | ExecutionBackend::DirectMLOnly
    );
    #[cfg(target_os = "windows")]
    {
        if wants_dml {
            if let Ok(true) = DirectMLExecutionProvider::default().is_available() {
                match try_build(true) {
                    Ok(session) => {
                        let device_id = cfg.resolved_device_id();
                        return Ok((session, InferenceProvider::DirectML { device_id }));
                    }
                    Err(err) => log::warn!("DirectML session failed: {err}"),
                }
            }
        }
    }

    if wants_dml && cfg.backend == ExecutionBackend::DirectMLOnly {
        log::warn!(
            "DirectML execution provider unavailable; falling back to CPU for {}",
            model_path.display()
        );
    }

    let session = try_build(false)?;
    Ok((session, InferenceProvider::Cpu))
}

fn tensor_dims(value_type: &ValueType) -> Option<Vec<i64>> {
    match value_type {
        ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
        _ => None,
    }
}

fn bind_session(
    session: &Session,
    model: &ModelConfig,
    provider: InferenceProvider,
    class_count: usize,
) -> Result<TensorBinding> {
    let path = model.model_path.as_path();
    let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
    let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

    let input = select_name(&input_names, Some(model.input_name.as_str()))
        .ok_or_else(|| Error::model_load(path, "graph declares no inputs"))?;
    let output = select_name(&output_names, model.output_name.as_deref())
        .ok_or_else(|| Error::model_load(path, "graph declares no outputs"))?;
    if input != model.input_name {
        log::debug!(
            "Configured input '{}' not declared by {}; using '{}'",
            model.input_name,
            path.display(),
            input
        );
    }

    if let Some(dims) = session
        .inputs
        .iter()
        .find(|i| i.name == input)
        .and_then(|i| tensor_dims(&i.input_type))
    {
        check_input_dims(&dims).map_err(|reason| Error::model_load(path, reason))?;
    }
    if let Some(dims) = session
        .outputs
        .iter()
        .find(|o| o.name == output)
        .and_then(|o| tensor_dims(&o.output_type))
    {
        check_output_dims(&dims, class_count).map_err(|reason| Error::model_load(path, reason))?;
    }

    Ok(TensorBinding {
        input,
        output,
        provider,
    })
}

/// Picks the configured name when the graph declares it, otherwise the first declared name.
fn select_name(declared: &[String], preferred: Option<&str>) -> Option<String> {
    if let Some(name) = preferred {
        if declared.iter().any(|d| d == name) {
            return Some(name.to_string());
        }
    }
    declared.first().cloned()
}

// Dynamic dimensions are reported as -1 (or 0) and accepted.
fn check_input_dims(dims: &[i64]) -> std::result::Result<(), String> {
    if dims.len() != INPUT_SHAPE.len() {
        return Err(format!("expected a 4D image input, graph declares {dims:?}"));
    }
    for (declared, expected) in dims.iter().zip(INPUT_SHAPE.iter()) {
        if *declared > 0 && *declared as usize != *expected {
            return Err(format!(
                "graph input shape {dims:?} is incompatible with {INPUT_SHAPE:?}"
            ));
        }
    }
    Ok(())
}

fn check_output_dims(dims: &[i64], class_count: usize) -> std::result::Result<(), String> {
    match dims.last() {
        Some(&last) if last > 0 && last as usize != class_count => Err(format!(
            "graph output has {last} classes but {class_count} labels are configured"
        )),
        _ => Ok(()),
    }
}

pub type SharedModel = Arc<Mutex<Box<dyn ClassifierModel>>>;

/// Everything a loaded session was built and bound with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub model_path: PathBuf,
    pub runtime: RuntimeConfig,
    pub input_name: String,
    pub output_name: Option<String>,
    pub class_count: usize,
}

impl SessionKey {
    fn new(model: &ModelConfig, runtime: RuntimeConfig, class_count: usize) -> Self {
        Self {
            model_path: canonical_model_path(&model.model_path),
            runtime,
            input_name: model.input_name.clone(),
            output_name: model.output_name.clone(),
            class_count,
        }
    }
}

fn canonical_model_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Default)]
struct SessionSlot {
    model: OnceLock<SharedModel>,
    loading: Mutex<()>,
}

/// Loaded sessions keyed by model path, runtime configuration and tensor binding.
///
/// A changed configuration is a different key, so it never reuses a session
/// built or validated with other options. Failed loads are not cached. The map
/// lock is only held for lookups; a slow load blocks callers of the same key
/// and nobody else.
#[derive(Default)]
pub struct SessionCache {
    sessions: Mutex<HashMap<SessionKey, Arc<SessionSlot>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<SessionSlot>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_load(
        &self,
        loader: &dyn ModelLoader,
        model: &ModelConfig,
        runtime: RuntimeConfig,
        class_count: usize,
    ) -> Result<SharedModel> {
        let key = SessionKey::new(model, runtime, class_count);
        let slot = self.slots().entry(key.clone()).or_default().clone();
        if let Some(shared) = slot.model.get() {
            log::debug!("Session cache hit for {}", key.model_path.display());
            return Ok(shared.clone());
        }

        let _loading = slot.loading.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(shared) = slot.model.get() {
            return Ok(shared.clone());
        }
        log::info!("Session cache miss for {}", key.model_path.display());
        match loader.load(model, runtime, class_count) {
            Ok(loaded) => {
                let shared: SharedModel = Arc::new(Mutex::new(loaded));
                Ok(slot.model.get_or_init(|| shared).clone())
            }
            Err(err) => {
                let mut slots = self.slots();
                if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(&key);
                }
                Err(err)
            }
        }
    }

    /// Drops every cached session for `model_path`, whatever its configuration.
    pub fn invalidate(&self, model_path: &Path) -> usize {
        let target = canonical_model_path(model_path);
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|key, _| key.model_path != target);
        before - slots.len()
    }

    pub fn clear(&self) {
        self.slots().clear();
    }

    /// Number of loaded sessions; loads still in flight are not counted.
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.model.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
