use crate::config::{ModelConfig, RuntimeConfig, Settings};
use crate::decision;
use crate::error::{AnalysisFailed, Error, Result, Stage};
use crate::models::{AnalysisOutcome, ClassificationResult};
use crate::onnx::{ModelLoader, OrtLoader, SessionCache, SharedModel};
use crate::preprocess;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runs scans through preprocessing, the cached model session and the softmax decision.
///
/// Cloning is cheap and clones share the session cache and the request
/// counter used to discard superseded results.
#[derive(Clone)]
pub struct Analyzer {
    inner: Arc<AnalyzerInner>,
}

struct AnalyzerInner {
    model: ModelConfig,
    runtime: RuntimeConfig,
    labels: Vec<String>,
    loader: Box<dyn ModelLoader>,
    cache: Arc<SessionCache>,
    generation: AtomicU64,
}

impl Analyzer {
    pub fn new(settings: Settings) -> Result<Self> {
        let loader = OrtLoader::new(settings.runtime_library.clone());
        Self::with_loader(settings, loader, Arc::new(SessionCache::new()))
    }

    pub fn with_loader(
        settings: Settings,
        loader: impl ModelLoader + 'static,
        cache: Arc<SessionCache>,
    ) -> Result<Self> {
        let labels = settings.model.resolve_labels()?;
        log::info!(
            "Analyzer bound to {} with classes [{}]",
            settings.model.model_path.display(),
            labels.join(", ")
        );
        Ok(Self {
            inner: Arc::new(AnalyzerInner {
                model: settings.model,
                runtime: settings.runtime,
                labels,
                loader: Box::new(loader),
                cache,
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.inner.labels
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.inner.cache
    }

    /// Loads the model ahead of the first scan so that the first analysis is not slowed by it.
    pub fn preload(&self) -> std::result::Result<(), AnalysisFailed> {
        self.session().map(|_| ()).map_err(|e| fail(Stage::Loading, e))
    }

    fn session(&self) -> Result<SharedModel> {
        let inner = &self.inner;
        inner.cache.get_or_load(
            inner.loader.as_ref(),
            &inner.model,
            inner.runtime,
            inner.labels.len(),
        )
    }

    /// Classifies one encoded image on the calling thread.
    pub fn infer(&self, image: &[u8]) -> std::result::Result<ClassificationResult, AnalysisFailed> {
        enter(Stage::Preprocessing);
        let tensor = preprocess::encode(image).map_err(|e| fail(Stage::Preprocessing, e))?;

        enter(Stage::Loading);
        let model = self.session().map_err(|e| fail(Stage::Loading, e))?;

        enter(Stage::Running);
        let (logits, provider) = {
            let mut model = model.lock().unwrap_or_else(|e| e.into_inner());
            let provider = model.binding().provider;
            (model.run(&tensor), provider)
        };
        let logits = logits.map_err(|e| fail(Stage::Running, e))?;

        enter(Stage::Postprocessing);
        let result =
            decision::decide(&logits, &self.inner.labels).map_err(|e| fail(Stage::Postprocessing, e))?;
        log::info!(
            "Predicted {} ({:.2}%) on {}",
            result.prediction,
            result.confidence * 100.0,
            provider.label()
        );
        Ok(result)
    }

    pub fn infer_file(&self, path: &Path) -> std::result::Result<ClassificationResult, AnalysisFailed> {
        let bytes = std::fs::read(path).map_err(|e| {
            fail(
                Stage::Preprocessing,
                Error::Decode(format!("failed to read {}: {e}", path.display())),
            )
        })?;
        self.infer(&bytes)
    }

    /// Classifies an image on the blocking pool.
    ///
    /// Starting another analysis on this analyzer (or a clone) before this one
    /// finishes makes this call return [`AnalysisOutcome::Superseded`],
    /// whatever its own result was.
    pub async fn analyze(
        &self,
        image: Vec<u8>,
    ) -> std::result::Result<AnalysisOutcome, AnalysisFailed> {
        let ticket = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let analyzer = self.clone();
        let joined = tokio::task::spawn_blocking(move || analyzer.infer(&image)).await;
        if self.inner.generation.load(Ordering::SeqCst) != ticket {
            log::info!("Discarding result of superseded analysis #{ticket}");
            return Ok(AnalysisOutcome::Superseded);
        }
        let result = joined.map_err(|e| {
            fail(
                Stage::Running,
                Error::Inference(format!("Task join error: {e}")),
            )
        })?;
        result.map(AnalysisOutcome::Completed)
    }

    /// Like [`Analyzer::analyze`], failing with an inference timeout once `limit` elapses.
    ///
    /// The forward pass cannot be interrupted; on timeout it finishes in the
    /// background and its result is dropped.
    pub async fn analyze_with_timeout(
        &self,
        image: Vec<u8>,
        limit: Duration,
    ) -> std::result::Result<AnalysisOutcome, AnalysisFailed> {
        match tokio::time::timeout(limit, self.analyze(image)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(fail(
                Stage::Running,
                Error::Inference(format!("timed out after {} ms", limit.as_millis())),
            )),
        }
    }
}

fn enter(stage: Stage) {
    log::debug!("Analysis stage: {stage}");
}

fn fail(stage: Stage, source: Error) -> AnalysisFailed {
    log::warn!("Analysis failed during {stage}: {source}");
    AnalysisFailed::at(stage, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::tests::StubLoader;
    use crate::preprocess::tests::uniform_rgb;

    fn settings() -> Settings {
        Settings {
            model: ModelConfig::default().with_model_path("stub/brain_v1.onnx"),
            ..Settings::default()
        }
    }

    fn analyzer_with(loader: Arc<StubLoader>) -> Analyzer {
        Analyzer::with_loader(settings(), loader, Arc::new(SessionCache::new())).unwrap()
    }

    #[test]
    fn gray_scan_with_flat_logits_is_uniform() {
        let analyzer = analyzer_with(Arc::new(StubLoader::returning(vec![1.0; 4])));
        let result = analyzer.infer(&uniform_rgb(224, 224, [128, 128, 128])).unwrap();
        assert_eq!(result.prediction, "Glioma");
        assert_eq!(result.confidence, 0.25);
        assert_eq!(result.probabilities.len(), 4);
        assert!(result.probabilities.iter().all(|(_, p)| *p == 0.25));
    }

    #[test]
    fn dominant_logit_selects_its_class() {
        let analyzer = analyzer_with(Arc::new(StubLoader::returning(vec![10.0, 0.0, 0.0, 0.0])));
        let result = analyzer.infer(&uniform_rgb(50, 80, [10, 20, 30])).unwrap();
        assert_eq!(result.prediction, "Glioma");
        assert!(result.confidence > 0.99);
    }

    #[test]
    fn short_output_is_malformed() {
        let analyzer = analyzer_with(Arc::new(StubLoader::returning(vec![0.1, 0.2, 0.3])));
        let err = analyzer.infer(&uniform_rgb(32, 32, [0, 0, 0])).unwrap_err();
        assert_eq!(err.stage, Stage::Postprocessing);
        assert!(matches!(
            err.source,
            Error::MalformedOutput {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn undecodable_image_fails_before_loading() {
        let loader = Arc::new(StubLoader::returning(vec![1.0; 4]));
        let analyzer = analyzer_with(loader.clone());
        let err = analyzer.infer(b"\x89PNG broken").unwrap_err();
        assert_eq!(err.stage, Stage::Preprocessing);
        assert!(matches!(err.source, Error::Decode(_)));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_model_reports_load_failure() {
        let settings = Settings {
            model: ModelConfig::default().with_model_path("nonexistent.onnx"),
            ..Settings::default()
        };
        let analyzer = Analyzer::new(settings).unwrap();
        let err = analyzer.infer(&uniform_rgb(16, 16, [1, 2, 3])).unwrap_err();
        assert_eq!(err.stage, Stage::Loading);
        assert!(matches!(err.source, Error::ModelLoad { .. }));
        assert!(err.reason().contains("nonexistent.onnx"));
        assert!(analyzer.preload().is_err());
    }

    #[test]
    fn session_is_loaded_once_across_requests() {
        let loader = Arc::new(StubLoader::returning(vec![0.0, 2.0, 0.0, 0.0]));
        let analyzer = analyzer_with(loader.clone());
        analyzer.preload().unwrap();
        for _ in 0..3 {
            let result = analyzer.infer(&uniform_rgb(20, 20, [9, 9, 9])).unwrap();
            assert_eq!(result.prediction, "Meningioma");
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(analyzer.cache().len(), 1);
    }

    #[test]
    fn configured_label_order_matches_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("btcs_v2.onnx");
        std::fs::write(
            dir.path().join("btcs_v2.labels.txt"),
            "Glioma\nMeningioma\nNo Tumor\nPituitary\n",
        )
        .unwrap();
        let settings = Settings {
            model: ModelConfig::default().with_model_path(&model_path),
            ..Settings::default()
        };
        let loader = StubLoader::returning(vec![0.0, 0.0, 6.0, 0.0]);
        let analyzer =
            Analyzer::with_loader(settings, loader, Arc::new(SessionCache::new())).unwrap();
        assert_eq!(
            analyzer.labels(),
            &["Glioma", "Meningioma", "No Tumor", "Pituitary"]
        );
        let result = analyzer.infer(&uniform_rgb(8, 8, [200, 10, 10])).unwrap();
        assert_eq!(result.prediction, "No Tumor");
    }

    #[test]
    fn concurrent_requests_are_independent() {
        let analyzer = analyzer_with(Arc::new(StubLoader::returning(vec![0.0, 0.0, 0.0, 3.0])));
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let analyzer = analyzer.clone();
                std::thread::spawn(move || analyzer.infer(&uniform_rgb(40, 40, [i * 50, 0, 0])))
            })
            .collect();
        for handle in handles {
            let result = handle.join().unwrap().unwrap();
            assert_eq!(result.prediction, "No Tumor");
        }
    }

    #[tokio::test]
    async fn analyze_completes_off_thread() {
        let analyzer = analyzer_with(Arc::new(StubLoader::returning(vec![1.0; 4])));
        let outcome = analyzer
            .analyze(uniform_rgb(224, 224, [128, 128, 128]))
            .await
            .unwrap();
        let result = outcome.into_result().unwrap();
        assert_eq!(result.confidence, 0.25);
    }

    #[tokio::test]
    async fn newer_request_supersedes_older_one() {
        let loader = Arc::new(StubLoader {
            logits: vec![1.0, 0.0, 0.0, 0.0],
            delay: Some(Duration::from_millis(300)),
            ..StubLoader::default()
        });
        let analyzer = analyzer_with(loader);
        let first = {
            let analyzer = analyzer.clone();
            tokio::spawn(async move { analyzer.analyze(uniform_rgb(30, 30, [1, 1, 1])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = analyzer
            .analyze(uniform_rgb(30, 30, [2, 2, 2]))
            .await
            .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), AnalysisOutcome::Superseded);
        assert!(matches!(second, AnalysisOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn timeout_is_an_inference_error() {
        let loader = Arc::new(StubLoader {
            logits: vec![1.0; 4],
            delay: Some(Duration::from_millis(500)),
            ..StubLoader::default()
        });
        let analyzer = analyzer_with(loader);
        let err = analyzer
            .analyze_with_timeout(uniform_rgb(30, 30, [1, 1, 1]), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Running);
        match err.source {
            Error::Inference(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn infer_file_reads_scan_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("scan.png");
        std::fs::write(&scan, uniform_rgb(64, 64, [90, 90, 90])).unwrap();
        let analyzer = analyzer_with(Arc::new(StubLoader::returning(vec![0.0, 0.0, 4.0, 0.0])));
        assert_eq!(analyzer.infer_file(&scan).unwrap().prediction, "Pituitary");

        let err = analyzer.infer_file(&dir.path().join("missing.png")).unwrap_err();
        assert_eq!(err.stage, Stage::Preprocessing);
        assert!(matches!(err.source, Error::Decode(_)));
    }

    #[test]
    fn shared_cache_revalidates_for_other_label_count() {
        let loader = Arc::new(StubLoader {
            logits: vec![0.0; 4],
            declared_classes: Some(4),
            ..StubLoader::default()
        });
        let cache = Arc::new(SessionCache::new());
        let four = Analyzer::with_loader(settings(), loader.clone(), cache.clone()).unwrap();
        four.preload().unwrap();

        let mut three_settings = settings();
        three_settings.model = three_settings
            .model
            .with_labels(["Glioma", "Meningioma", "No Tumor"]);
        let three = Analyzer::with_loader(three_settings, loader.clone(), cache.clone()).unwrap();
        let err = three.infer(&uniform_rgb(16, 16, [5, 5, 5])).unwrap_err();
        assert_eq!(err.stage, Stage::Loading);
        assert!(matches!(err.source, Error::ModelLoad { .. }));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);

        assert!(four.infer(&uniform_rgb(16, 16, [5, 5, 5])).is_ok());
    }

    #[test]
    fn slow_load_does_not_block_cached_model() {
        let cache = Arc::new(SessionCache::new());
        let fast = Analyzer::with_loader(
            Settings {
                model: ModelConfig::default().with_model_path("stub/fast.onnx"),
                ..Settings::default()
            },
            Arc::new(StubLoader::returning(vec![1.0, 0.0, 0.0, 0.0])),
            cache.clone(),
        )
        .unwrap();
        fast.preload().unwrap();

        let slow = Analyzer::with_loader(
            Settings {
                model: ModelConfig::default().with_model_path("stub/slow.onnx"),
                ..Settings::default()
            },
            Arc::new(StubLoader {
                logits: vec![1.0; 4],
                load_delay: Some(Duration::from_millis(800)),
                ..StubLoader::default()
            }),
            cache.clone(),
        )
        .unwrap();
        let loading = std::thread::spawn(move || slow.preload());
        std::thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let result = fast.infer(&uniform_rgb(24, 24, [3, 3, 3])).unwrap();
        let waited = started.elapsed();
        assert_eq!(result.prediction, "Glioma");
        assert!(waited < Duration::from_millis(400), "waited {waited:?}");

        loading.join().unwrap().unwrap();
        assert_eq!(cache.len(), 2);
    }
}
