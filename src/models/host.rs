//! Lazy, single-model inference host
//!
//! Holds at most one classifier. The model is loaded on the first prediction
//! (or an explicit warm-up) and dropped again on `clear`, either on request
//! or when the pressure monitor decides memory is running out.

use crate::error::{Result, ServeError};
use crate::labels::ClassLabelTable;
use crate::memory;
use crate::models::loader::{LoadedModel, WeightLoader};
use crate::preprocess::{ImageNormalizer, NormalizedTensor};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of the hosted model
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
}

impl ModelState {
    fn as_u8(self) -> u8 {
        match self {
            ModelState::Unloaded => 0,
            ModelState::Loading => 1,
            ModelState::Loaded => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ModelState::Loading,
            2 => ModelState::Loaded,
            _ => ModelState::Unloaded,
        }
    }
}

/// Result of a single-image prediction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    pub class_id: usize,
    pub label: String,
}

/// Owns the one model instance of the process.
///
/// `predict`, `warm_up` and `clear` share one critical section, so a model is
/// never evicted mid-inference and concurrent first requests load it once.
pub struct InferenceHost {
    loader: Box<dyn WeightLoader>,
    labels: Arc<ClassLabelTable>,
    normalizer: ImageNormalizer,
    /// `None` while unloaded
    slot: Mutex<Option<LoadedModel>>,
    /// Mirror of the lifecycle readable without taking `slot`
    state: AtomicU8,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl InferenceHost {
    /// Create an unloaded host.
    ///
    /// Fails with a configuration error when the label table disagrees with the
    /// loader's declared output width, or with the width stored in the weights
    /// file when that can be read without loading the model.
    pub fn new(loader: Box<dyn WeightLoader>, labels: Arc<ClassLabelTable>) -> Result<Self> {
        labels.ensure_width(loader.declared_output_width())?;

        match loader.probe_output_width() {
            Ok(Some(stored)) => labels.ensure_width(stored)?,
            Ok(None) => debug!("Weights do not expose a head width, checking at load time"),
            Err(e) => warn!(error = %e, "Could not probe weights, deferring check to first load"),
        }

        Ok(Self {
            loader,
            labels,
            normalizer: ImageNormalizer::new(),
            slot: Mutex::new(None),
            state: AtomicU8::new(ModelState::Unloaded.as_u8()),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ModelState {
        ModelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ModelState::Loaded
    }

    /// Completed load sequences since construction
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Models dropped by `clear` since construction
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn labels(&self) -> &ClassLabelTable {
        &self.labels
    }

    /// Classify one encoded image, loading the model first if needed.
    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        // Touches no shared state, so it stays outside the lock
        let input = self.normalizer.normalize_bytes(image_bytes)?;
        self.predict_normalized(input)
    }

    /// Classify an already normalized image. The tensor is consumed and
    /// released before this returns.
    pub fn predict_normalized(&self, input: NormalizedTensor) -> Result<Prediction> {
        let started = Instant::now();
        let mut slot = self.lock_slot();

        let model = self.ensure_loaded(&mut slot)?;
        let scores = model.classifier.forward(&input);
        drop(input);
        let scores = scores?;

        let class_id = argmax(&scores)?;
        drop(scores);
        let label = self.labels.resolve(class_id)?.to_string();

        debug!(
            model = %model.name,
            class_id,
            label = %label,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Prediction complete"
        );

        Ok(Prediction { class_id, label })
    }

    /// Load the model now if it is not already resident.
    pub fn warm_up(&self) -> Result<()> {
        let mut slot = self.lock_slot();
        self.ensure_loaded(&mut slot).map(|_| ())
    }

    /// Drop the model if loaded and trim the allocator. Idempotent.
    ///
    /// Returns whether a model was evicted.
    pub fn clear(&self) -> bool {
        let evicted = {
            let mut slot = self.lock_slot();
            match slot.take() {
                Some(model) => {
                    let name = model.name.clone();
                    let resident_mb = model.resident_bytes / (1024 * 1024);
                    // Dropped under the lock: no new load can start before this is freed
                    drop(model);
                    self.state
                        .store(ModelState::Unloaded.as_u8(), Ordering::Release);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    info!(model = %name, resident_mb, "Classifier unloaded");
                    true
                }
                None => false,
            }
        };

        memory::reclaim();
        evicted
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<LoadedModel>> {
        // A panic inside a forward pass leaves the slot intact
        self.slot.lock().unwrap_or_else(|poisoned| {
            warn!("Model slot recovered after a panic");
            self.slot.clear_poison();
            poisoned.into_inner()
        })
    }

    fn ensure_loaded<'a>(
        &self,
        slot: &'a mut MutexGuard<'_, Option<LoadedModel>>,
    ) -> Result<&'a LoadedModel> {
        if slot.is_none() {
            let model = self.load_model()?;
            **slot = Some(model);
            self.state.store(ModelState::Loaded.as_u8(), Ordering::Release);
            self.loads.fetch_add(1, Ordering::Relaxed);
        }

        slot.as_ref()
            .ok_or_else(|| ServeError::Inference("model slot empty after load".to_string()))
    }

    fn load_model(&self) -> Result<LoadedModel> {
        let loading = LoadingState::enter(&self.state);
        let started = Instant::now();

        let loaded = self.loader.load().and_then(|model| {
            self.labels.ensure_width(model.classifier.num_classes())?;
            Ok(model)
        });

        match loaded {
            Ok(model) => {
                info!(
                    model = %model.name,
                    resident_mb = model.resident_bytes / (1024 * 1024),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Classifier ready"
                );
                loading.finish();
                Ok(model)
            }
            Err(e) => {
                drop(loading);
                memory::reclaim();
                error!(error = %e, "Classifier load failed, host stays unloaded");
                Err(e)
            }
        }
    }
}

/// Marks the host `Loading` until finished. Dropping it unfinished, on an
/// error or a panicking loader, puts the host back to `Unloaded`.
struct LoadingState<'a> {
    state: &'a AtomicU8,
    finished: bool,
}

impl<'a> LoadingState<'a> {
    fn enter(state: &'a AtomicU8) -> Self {
        state.store(ModelState::Loading.as_u8(), Ordering::Release);
        Self {
            state,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for LoadingState<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state
                .store(ModelState::Unloaded.as_u8(), Ordering::Release);
        }
    }
}

/// Index of the largest score, first one on ties.
pub fn argmax(scores: &[f32]) -> Result<usize> {
    if scores.is_empty() {
        return Err(ServeError::Inference("model returned no scores".to_string()));
    }
    if let Some(pos) = scores.iter().position(|s| !s.is_finite()) {
        return Err(ServeError::Inference(format!(
            "non-finite score {} at index {}",
            scores[pos], pos
        )));
    }

    let mut best = 0;
    for (idx, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = idx;
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::loader::ImageClassifier;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    struct FixedClassifier {
        scores: Vec<f32>,
    }

    impl ImageClassifier for FixedClassifier {
        fn forward(&self, _input: &NormalizedTensor) -> Result<Vec<f32>> {
            Ok(self.scores.clone())
        }

        fn num_classes(&self) -> usize {
            self.scores.len()
        }
    }

    struct FailingClassifier;

    impl ImageClassifier for FailingClassifier {
        fn forward(&self, _input: &NormalizedTensor) -> Result<Vec<f32>> {
            Err(ServeError::Inference("device lost".to_string()))
        }

        fn num_classes(&self) -> usize {
            4
        }
    }

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        winner: usize,
        width: usize,
    }

    impl WeightLoader for CountingLoader {
        fn load(&self) -> Result<LoadedModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let mut scores = vec![0.0; self.width];
            scores[self.winner] = 5.0;
            Ok(LoadedModel {
                name: "fixed".to_string(),
                classifier: Box::new(FixedClassifier { scores }),
                resident_bytes: 0,
            })
        }

        fn declared_output_width(&self) -> usize {
            4
        }
    }

    struct BrokenLoader;

    impl WeightLoader for BrokenLoader {
        fn load(&self) -> Result<LoadedModel> {
            Err(ServeError::WeightLoad("truncated".to_string()))
        }

        fn declared_output_width(&self) -> usize {
            4
        }
    }

    struct FailingForwardLoader;

    impl WeightLoader for FailingForwardLoader {
        fn load(&self) -> Result<LoadedModel> {
            Ok(LoadedModel {
                name: "failing".to_string(),
                classifier: Box::new(FailingClassifier),
                resident_bytes: 0,
            })
        }

        fn declared_output_width(&self) -> usize {
            4
        }
    }

    fn labels() -> Arc<ClassLabelTable> {
        Arc::new(
            ClassLabelTable::from_names(
                ["Audi A4 Sedan 2008", "BMW M5 Sedan 2010", "Fisker Karma 2012", "Jeep Wrangler SUV 2012"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            )
            .unwrap(),
        )
    }

    fn counting_host(winner: usize, width: usize) -> (InferenceHost, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = CountingLoader {
            loads: loads.clone(),
            winner,
            width,
        };
        (InferenceHost::new(Box::new(loader), labels()).unwrap(), loads)
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([90, 10, 200])));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.9, 0.3]).unwrap(), 1);
        assert_eq!(argmax(&[2.0, 2.0, 1.0]).unwrap(), 0);
        assert_eq!(argmax(&[-3.0, -1.0]).unwrap(), 1);
        assert!(argmax(&[]).is_err());
        assert!(argmax(&[0.1, f32::NAN]).is_err());
    }

    #[test]
    fn test_lazy_load() {
        let (host, loads) = counting_host(1, 4);
        assert_eq!(host.state(), ModelState::Unloaded);
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let prediction = host.predict(&png(64, 48)).unwrap();
        assert_eq!(prediction.class_id, 1);
        assert_eq!(prediction.label, "BMW M5 Sedan 2010");
        assert_eq!(host.state(), ModelState::Loaded);

        host.predict(&png(32, 32)).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(host.load_count(), 1);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (host, loads) = counting_host(2, 4);
        assert!(!host.clear());

        host.warm_up().unwrap();
        assert!(host.is_loaded());

        assert!(host.clear());
        assert_eq!(host.state(), ModelState::Unloaded);
        assert!(!host.clear());
        assert_eq!(host.state(), ModelState::Unloaded);
        assert_eq!(host.eviction_count(), 1);

        // Reload after clear
        host.predict(&png(16, 16)).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_warm_up_is_noop_when_loaded() {
        let (host, loads) = counting_host(0, 4);
        host.warm_up().unwrap();
        host.warm_up().unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_error_does_not_load() {
        let (host, loads) = counting_host(0, 4);
        let err = host.predict(b"not an image").unwrap_err();
        assert!(matches!(err, ServeError::ImageDecode(_)));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert_eq!(host.state(), ModelState::Unloaded);
    }

    #[test]
    fn test_load_failure_leaves_host_unloaded() {
        let host = InferenceHost::new(Box::new(BrokenLoader), labels()).unwrap();
        let err = host.predict(&png(20, 20)).unwrap_err();
        assert!(matches!(err, ServeError::WeightLoad(_)));
        assert_eq!(host.state(), ModelState::Unloaded);
        assert_eq!(host.load_count(), 0);

        // Retries on the next call
        assert!(host.warm_up().is_err());
    }

    #[test]
    fn test_width_mismatch_at_load() {
        let (host, _) = counting_host(0, 5);
        let err = host.warm_up().unwrap_err();
        assert!(matches!(err, ServeError::Configuration(_)));
        assert_eq!(host.state(), ModelState::Unloaded);
    }

    #[test]
    fn test_declared_width_checked_eagerly() {
        let table = Arc::new(
            ClassLabelTable::from_names(vec!["only one".to_string()]).unwrap(),
        );
        let result = InferenceHost::new(Box::new(BrokenLoader), table);
        assert!(matches!(result, Err(ServeError::Configuration(_))));
    }

    #[test]
    fn test_inference_error_keeps_model() {
        let host = InferenceHost::new(Box::new(FailingForwardLoader), labels()).unwrap();
        let err = host.predict(&png(20, 20)).unwrap_err();
        assert!(matches!(err, ServeError::Inference(_)));
        assert_eq!(host.state(), ModelState::Loaded);

        let err = host.predict(&png(20, 20)).unwrap_err();
        assert!(matches!(err, ServeError::Inference(_)));
        assert_eq!(host.load_count(), 1);
    }

    /// Panics on the first call only
    struct PanicOnceLoader {
        calls: AtomicUsize,
    }

    impl WeightLoader for PanicOnceLoader {
        fn load(&self) -> Result<LoadedModel> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("loader blew up");
            }
            Ok(LoadedModel {
                name: "second try".to_string(),
                classifier: Box::new(FixedClassifier {
                    scores: vec![0.0, 0.0, 1.0, 0.0],
                }),
                resident_bytes: 0,
            })
        }

        fn declared_output_width(&self) -> usize {
            4
        }
    }

    struct PanicOnceClassifier {
        calls: AtomicUsize,
    }

    impl ImageClassifier for PanicOnceClassifier {
        fn forward(&self, _input: &NormalizedTensor) -> Result<Vec<f32>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("forward blew up");
            }
            Ok(vec![0.0, 0.0, 0.0, 1.0])
        }

        fn num_classes(&self) -> usize {
            4
        }
    }

    struct PanickingForwardLoader;

    impl WeightLoader for PanickingForwardLoader {
        fn load(&self) -> Result<LoadedModel> {
            Ok(LoadedModel {
                name: "flaky".to_string(),
                classifier: Box::new(PanicOnceClassifier {
                    calls: AtomicUsize::new(0),
                }),
                resident_bytes: 0,
            })
        }

        fn declared_output_width(&self) -> usize {
            4
        }
    }

    #[test]
    fn test_panicking_load_resets_state() {
        let loader = PanicOnceLoader {
            calls: AtomicUsize::new(0),
        };
        let host = InferenceHost::new(Box::new(loader), labels()).unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| host.warm_up()));
        assert!(outcome.is_err());
        assert_eq!(host.state(), ModelState::Unloaded);
        assert_eq!(host.load_count(), 0);

        // Lock is usable again and the next call loads
        let prediction = host.predict(&png(24, 24)).unwrap();
        assert_eq!(prediction.label, "Fisker Karma 2012");
        assert_eq!(host.state(), ModelState::Loaded);
    }

    #[test]
    fn test_panicking_forward_keeps_host_usable() {
        let host = InferenceHost::new(Box::new(PanickingForwardLoader), labels()).unwrap();

        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| host.predict(&png(24, 24))));
        assert!(outcome.is_err());
        assert_eq!(host.state(), ModelState::Loaded);

        let prediction = host.predict(&png(24, 24)).unwrap();
        assert_eq!(prediction.label, "Jeep Wrangler SUV 2012");
        assert_eq!(host.load_count(), 1);

        assert!(host.clear());
        assert_eq!(host.state(), ModelState::Unloaded);
    }
}
