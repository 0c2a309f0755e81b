//! Verification orchestrator.
//!
//! Extracts the reference, then the candidate, then scores them. Any
//! extraction failure hands the whole request to the external fallback
//! verifier; the caller always gets exactly one result, never a mix of the
//! two paths.

use crate::config::Config;
use crate::fallback::{FallbackSettings, ProcessVerifier};
use crate::model_state::{ModelLoader, ModelState, OnnxModelLoader};
use facegate_core::image_source::{self, payload_bytes};
use facegate_core::types::DESCRIPTOR_DIM;
use facegate_core::{
    ExtractError, FaceDescriptor, FacePipeline, FrameDecoder, Gate, ImageCrateDecoder,
    ImageDataError, ModelLoadError, PreprocessOptions, VerificationResult,
};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::Instrument;

/// Where a verification is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ExtractingReference,
    ExtractingCandidate,
    Scoring,
    Fallback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ExtractingReference => "reference extraction",
            Stage::ExtractingCandidate => "candidate extraction",
            Stage::Scoring => "scoring",
            Stage::Fallback => "fallback",
        })
    }
}

/// Why the descriptor path could not produce a descriptor.
#[derive(Error, Debug)]
pub enum ExtractFailure {
    #[error("model load failed: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("invalid image data for {stage}: {source}")]
    InvalidImageData {
        stage: Stage,
        #[source]
        source: ImageDataError,
    },
    /// Descriptor extraction failed. `verify` routes this to the fallback
    /// verifier; `enroll` and `verify_enrolled` surface it.
    #[error("{stage} failed: {source}")]
    Extraction {
        stage: Stage,
        #[source]
        source: ExtractFailure,
    },
    #[error("internal failure during {stage}: {reason}")]
    Internal { stage: Stage, reason: String },
}

/// Snapshot of the verifier's state, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub models_loaded: bool,
    pub model_load_attempts: usize,
    pub model_dir: PathBuf,
    pub match_threshold: f32,
    pub fallback_program: PathBuf,
    pub fallback_in_flight: usize,
    pub degraded_match: bool,
}

enum BlockingFailure {
    Image(ImageDataError),
    Extract(ExtractError),
    NoIdleModels,
}

/// The face verification service.
pub struct Verifier<L: ModelLoader = OnnxModelLoader> {
    models: ModelState<L>,
    decoder: Arc<dyn FrameDecoder>,
    extract_permits: Arc<Semaphore>,
    fallback: ProcessVerifier,
    gate: Gate,
    preprocess: PreprocessOptions,
    match_threshold: f32,
    extract_timeout: Duration,
    model_dir: PathBuf,
}

impl Verifier<OnnxModelLoader> {
    /// ONNX models from the configured directory, images decoded by the `image` crate.
    pub fn from_config(config: &Config) -> Self {
        let loader = OnnxModelLoader {
            paths: config.model_paths(),
            intra_threads: config.inference_threads,
        };
        Self::new(config, loader, Arc::new(ImageCrateDecoder))
    }
}

impl<L> Verifier<L>
where
    L: ModelLoader,
    L::Models: FacePipeline,
{
    pub fn new(config: &Config, loader: L, decoder: Arc<dyn FrameDecoder>) -> Self {
        let fallback = ProcessVerifier::new(FallbackSettings {
            program: config.fallback_program.clone(),
            args: config.fallback_args.iter().map(Into::into).collect(),
            env: vec![("FACEGATE_MODEL_DIR".into(), config.model_dir.clone().into())],
            timeout: config.fallback_timeout(),
            max_concurrent: config.max_concurrent_fallbacks,
            match_threshold: config.match_threshold,
            degraded_min_payload_bytes: config.degraded_min_payload_bytes,
            degraded_match: config.degraded_match,
        });

        // One permit per pooled model set, so a permit always finds an idle set.
        let parallel = config.max_concurrent_extractions.max(1);
        Self {
            models: ModelState::new(loader, parallel),
            decoder,
            extract_permits: Arc::new(Semaphore::new(parallel)),
            fallback,
            gate: config.gate(),
            preprocess: config.preprocess_options(),
            match_threshold: config.match_threshold,
            extract_timeout: config.extract_timeout(),
            model_dir: config.model_dir.clone(),
        }
    }

    /// Load the models now instead of on the first request.
    pub async fn warm_up(&self) -> Result<(), ModelLoadError> {
        self.models.ensure_ready().await.map(drop)
    }

    /// Decide whether `reference` and `candidate` show the same person.
    ///
    /// Extraction failures never surface here; they produce a fallback result.
    /// Only malformed payloads and internal faults are errors.
    pub async fn verify(
        &self,
        reference: &[u8],
        candidate: &[u8],
    ) -> Result<VerificationResult, VerifyError> {
        let span = tracing::info_span!(
            "verify",
            request_id = %uuid::Uuid::new_v4(),
            reference_bytes = reference.len(),
            candidate_bytes = candidate.len(),
        );
        self.verify_inner(reference, candidate).instrument(span).await
    }

    async fn verify_inner(
        &self,
        reference: &[u8],
        candidate: &[u8],
    ) -> Result<VerificationResult, VerifyError> {
        check_payload(reference, Stage::ExtractingReference)?;
        check_payload(candidate, Stage::ExtractingCandidate)?;

        let descriptors = match self.descriptor(reference, Stage::ExtractingReference).await {
            Ok(reference) => self
                .descriptor(candidate, Stage::ExtractingCandidate)
                .await
                .map(|candidate| (reference, candidate)),
            Err(err) => Err(err),
        };

        match descriptors {
            Ok((reference, candidate)) => {
                tracing::debug!(stage = %Stage::Scoring, "both descriptors extracted");
                let result = VerificationResult::model(reference.similarity(&candidate), self.match_threshold);
                tracing::info!(
                    matched = result.matched,
                    similarity = result.similarity,
                    source = %result.source,
                    "verification complete"
                );
                Ok(result)
            }
            Err(VerifyError::Extraction { stage, source }) => {
                tracing::warn!(
                    stage = %stage,
                    error = %source,
                    "descriptor path failed; routing to fallback verifier"
                );
                let mut result = self.fallback.verify(reference, candidate).await;
                let trigger = format!("primary matcher unavailable ({stage}: {source})");
                result.error = Some(match result.error.take() {
                    Some(detail) => format!("{trigger}; {detail}"),
                    None => trigger,
                });
                tracing::info!(
                    matched = result.matched,
                    similarity = result.similarity,
                    source = %result.source,
                    "verification complete (reduced trust)"
                );
                Ok(result)
            }
            Err(err) => {
                tracing::error!(error = %err, "verification failed");
                Err(err)
            }
        }
    }

    /// Extract a descriptor for Face ID registration.
    pub async fn enroll(&self, image: &[u8]) -> Result<FaceDescriptor, VerifyError> {
        let span = tracing::info_span!("enroll", request_id = %uuid::Uuid::new_v4());
        async {
            check_payload(image, Stage::ExtractingReference)?;
            let descriptor = self.descriptor(image, Stage::ExtractingReference).await?;
            tracing::info!(dims = descriptor.len(), "face descriptor enrolled");
            Ok(descriptor)
        }
        .instrument(span)
        .await
    }

    /// Compare a stored descriptor against a fresh capture.
    ///
    /// There is no reference image to hand to the fallback verifier, so
    /// extraction failures are returned to the caller.
    pub async fn verify_enrolled(
        &self,
        enrolled: &FaceDescriptor,
        candidate: &[u8],
    ) -> Result<VerificationResult, VerifyError> {
        let span = tracing::info_span!("verify_enrolled", request_id = %uuid::Uuid::new_v4());
        async {
            if enrolled.len() != DESCRIPTOR_DIM {
                tracing::warn!(dims = enrolled.len(), "enrolled descriptor has unexpected length; it cannot match");
            }
            check_payload(candidate, Stage::ExtractingCandidate)?;
            let capture = self.descriptor(candidate, Stage::ExtractingCandidate).await?;
            let result = VerificationResult::model(enrolled.similarity(&capture), self.match_threshold);
            tracing::info!(matched = result.matched, similarity = result.similarity, "verification complete");
            Ok(result)
        }
        .instrument(span)
        .await
    }

    pub fn status(&self) -> Status {
        let settings = self.fallback.settings();
        Status {
            version: env!("CARGO_PKG_VERSION"),
            models_loaded: self.models.is_loaded(),
            model_load_attempts: self.models.load_attempts(),
            model_dir: self.model_dir.clone(),
            match_threshold: self.match_threshold,
            fallback_program: settings.program.clone(),
            fallback_in_flight: self.fallback.in_flight(),
            degraded_match: settings.degraded_match,
        }
    }

    /// Run one image through preprocess → detect → gate → encode.
    async fn descriptor(&self, payload: &[u8], stage: Stage) -> Result<FaceDescriptor, VerifyError> {
        tracing::debug!(stage = %stage, "extracting descriptor");
        let extraction = |source: ExtractFailure| VerifyError::Extraction { stage, source };

        let pool = self
            .models
            .ensure_ready()
            .await
            .map_err(|e| extraction(e.into()))?;

        let deadline = Instant::now() + self.extract_timeout;
        let timed_out = || extraction(ExtractFailure::Timeout(self.extract_timeout));

        let permit = tokio::time::timeout_at(deadline, Arc::clone(&self.extract_permits).acquire_owned())
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| VerifyError::Internal { stage, reason: e.to_string() })?;

        let decoder = Arc::clone(&self.decoder);
        let payload = payload.to_vec();
        let options = self.preprocess;
        let gate = self.gate;

        let task = tokio::task::spawn_blocking(move || {
            // Held until the work finishes, even if the caller stops waiting.
            let _permit = permit;
            let image = image_source::preprocess(decoder.as_ref(), &payload, &options)
                .map_err(BlockingFailure::Image)?;
            let mut pipeline = pool.checkout().ok_or(BlockingFailure::NoIdleModels)?;
            facegate_core::extract(&mut *pipeline, &image, &gate).map_err(BlockingFailure::Extract)
        });

        match tokio::time::timeout_at(deadline, task).await {
            Err(_) => Err(timed_out()),
            Ok(Err(join)) => Err(VerifyError::Internal { stage, reason: join.to_string() }),
            Ok(Ok(Ok(descriptor))) => Ok(descriptor),
            Ok(Ok(Err(BlockingFailure::Image(source)))) => Err(VerifyError::InvalidImageData { stage, source }),
            Ok(Ok(Err(BlockingFailure::Extract(err)))) => Err(extraction(err.into())),
            Ok(Ok(Err(BlockingFailure::NoIdleModels))) => Err(VerifyError::Internal {
                stage,
                reason: "no idle model set despite holding an extraction permit".to_string(),
            }),
        }
    }
}

fn check_payload(payload: &[u8], stage: Stage) -> Result<(), VerifyError> {
    payload_bytes(payload)
        .map(drop)
        .map_err(|source| VerifyError::InvalidImageData { stage, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{BoundingBox, Source};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reads the scene from the image colour: blue < 32 means no face, green is
    /// the detector confidence, red picks one of four identities.
    struct ColourPipeline;

    fn centre(image: &RgbImage) -> [u8; 3] {
        image.get_pixel(image.width() / 2, image.height() / 2).0
    }

    impl FacePipeline for ColourPipeline {
        fn detect(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, ExtractError> {
            let [_, g, b] = centre(image);
            if b < 32 {
                return Ok(None);
            }
            Ok(Some(BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 100.0,
                height: 100.0,
                confidence: g as f32 / 255.0,
                landmarks: None,
            }))
        }

        fn describe(&mut self, image: &RgbImage, _face: &BoundingBox) -> Result<FaceDescriptor, ExtractError> {
            let identity = (centre(image)[0] / 64) as usize;
            let mut values = vec![0.0; DESCRIPTOR_DIM];
            values[identity] = 1.0;
            Ok(FaceDescriptor::new(values))
        }
    }

    struct ColourLoader {
        loads: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ModelLoader for ColourLoader {
        type Models = ColourPipeline;

        fn load(&self) -> Result<ColourPipeline, ModelLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ModelLoadError::MissingFile("/models/scrfd_500m.onnx".into()))
            } else {
                Ok(ColourPipeline)
            }
        }
    }

    fn png(rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(64, 64, Rgb(rgb));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn verifier(fail: bool) -> (Verifier<ColourLoader>, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let config = Config {
            fallback_program: PathBuf::from("/nonexistent/facegate-fallback"),
            max_concurrent_extractions: 1,
            ..Config::default()
        };
        let loader = ColourLoader { loads: Arc::clone(&loads), fail };
        (Verifier::new(&config, loader, Arc::new(ImageCrateDecoder)), loads)
    }

    const ALICE: [u8; 3] = [20, 250, 200];
    const BOB: [u8; 3] = [220, 250, 200];
    const NO_FACE: [u8; 3] = [20, 250, 0];
    const BLURRY: [u8; 3] = [20, 60, 200];

    #[tokio::test]
    async fn test_same_identity_matches_on_model_path() {
        let (v, _) = verifier(false);
        let r = v.verify(&png(ALICE), &png(ALICE)).await.unwrap();
        assert!(r.matched);
        assert_eq!(r.source, Source::Model);
        assert!((r.similarity - 100.0).abs() < 1e-3);
        assert!(r.error.is_none());
    }

    #[tokio::test]
    async fn test_different_identity_rejected_on_model_path() {
        let (v, _) = verifier(false);
        let r = v.verify(&png(ALICE), &png(BOB)).await.unwrap();
        assert!(!r.matched);
        assert_eq!(r.source, Source::Model);
        assert_eq!(r.similarity, 0.0);
    }

    #[tokio::test]
    async fn test_no_face_routes_to_fallback() {
        let (v, _) = verifier(false);
        let r = v.verify(&png(ALICE), &png(NO_FACE)).await.unwrap();
        assert_eq!(r.source, Source::Fallback);
        let error = r.error.unwrap();
        assert!(error.contains("candidate extraction"), "error: {error}");
        assert!(error.contains("no face detected"), "error: {error}");
    }

    #[tokio::test]
    async fn test_low_confidence_routes_to_fallback() {
        let (v, _) = verifier(false);
        let r = v.verify(&png(BLURRY), &png(ALICE)).await.unwrap();
        assert_eq!(r.source, Source::Fallback);
        // Small PNGs are under the payload floor, so the degraded verdict rejects.
        assert!(!r.matched);
        assert_eq!(r.similarity, 10.0);
        assert!(r.error.unwrap().contains("reference extraction"));
    }

    #[tokio::test]
    async fn test_model_load_failure_routes_to_fallback_and_retries() {
        let (v, loads) = verifier(true);
        let r = v.verify(&png(ALICE), &png(ALICE)).await.unwrap();
        assert_eq!(r.source, Source::Fallback);
        assert!(r.error.unwrap().contains("model weights missing"));
        assert!(!v.status().models_loaded);

        v.verify(&png(ALICE), &png(ALICE)).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2, "a failed load must be retried");
    }

    #[tokio::test]
    async fn test_invalid_payload_is_a_structured_error() {
        let (v, _) = verifier(false);
        let err = v.verify(b"*** not an image ***", &png(ALICE)).await.unwrap_err();
        assert!(matches!(
            err,
            VerifyError::InvalidImageData { stage: Stage::ExtractingReference, .. }
        ));
    }

    #[tokio::test]
    async fn test_undecodable_image_is_a_structured_error() {
        use base64::Engine;
        let (v, _) = verifier(false);
        let payload = base64::engine::general_purpose::STANDARD.encode(b"plain text, not pixels");
        let err = v.verify(&png(ALICE), payload.as_bytes()).await.unwrap_err();
        assert!(matches!(
            err,
            VerifyError::InvalidImageData { stage: Stage::ExtractingCandidate, .. }
        ));
    }

    #[tokio::test]
    async fn test_enroll_and_verify_enrolled() {
        let (v, _) = verifier(false);
        let enrolled = v.enroll(&png(BOB)).await.unwrap();
        assert_eq!(enrolled.len(), DESCRIPTOR_DIM);

        let hit = v.verify_enrolled(&enrolled, &png(BOB)).await.unwrap();
        assert!(hit.matched);
        let miss = v.verify_enrolled(&enrolled, &png(ALICE)).await.unwrap();
        assert!(!miss.matched);
    }

    #[tokio::test]
    async fn test_verify_enrolled_surfaces_extraction_failure() {
        let (v, _) = verifier(false);
        let enrolled = v.enroll(&png(BOB)).await.unwrap();
        let err = v.verify_enrolled(&enrolled, &png(BLURRY)).await.unwrap_err();
        match err {
            VerifyError::Extraction { source: ExtractFailure::Extract(e), .. } => {
                assert!(matches!(e, ExtractError::AntiSpoofRejected { .. }));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_base64_payloads_accepted() {
        use base64::Engine;
        let (v, _) = verifier(false);
        let encoded = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png(ALICE))
        );
        let r = v.verify(encoded.as_bytes(), &png(ALICE)).await.unwrap();
        assert!(r.matched);
        assert_eq!(r.source, Source::Model);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_calls_load_once() {
        let (v, loads) = verifier(false);
        let v = Arc::new(v);
        let reference = png(ALICE);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let v = Arc::clone(&v);
                let reference = reference.clone();
                tokio::spawn(async move { v.verify(&reference, &reference).await })
            })
            .collect();

        for h in handles {
            let r = h.await.unwrap().unwrap();
            assert_eq!(r.source, Source::Model);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(v.status().models_loaded);
    }

    /// Tracks how many detections run at once.
    struct SlowPipeline {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FacePipeline for SlowPipeline {
        fn detect(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, ExtractError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.running.fetch_sub(1, Ordering::SeqCst);
            ColourPipeline.detect(image)
        }

        fn describe(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceDescriptor, ExtractError> {
            ColourPipeline.describe(image, face)
        }
    }

    struct SlowLoader {
        loads: Arc<AtomicUsize>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl ModelLoader for SlowLoader {
        type Models = SlowPipeline;

        fn load(&self) -> Result<SlowPipeline, ModelLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(SlowPipeline {
                running: Arc::clone(&self.running),
                peak: Arc::clone(&self.peak),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_extractions_bounded_and_run_in_parallel() {
        let loads = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let loader = SlowLoader {
            loads: Arc::clone(&loads),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        let config = Config {
            fallback_program: PathBuf::from("/nonexistent/facegate-fallback"),
            max_concurrent_extractions: 3,
            ..Config::default()
        };
        let v = Arc::new(Verifier::new(&config, loader, Arc::new(ImageCrateDecoder)));
        let reference = png(ALICE);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let v = Arc::clone(&v);
                let reference = reference.clone();
                tokio::spawn(async move { v.verify(&reference, &reference).await })
            })
            .collect();

        for h in handles {
            let r = h.await.unwrap().unwrap();
            assert_eq!(r.source, Source::Model, "error: {:?}", r.error);
            assert!(r.matched);
        }
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "{peak} detections ran at once");
        assert!(peak > 1, "extractions never overlapped");
        assert_eq!(loads.load(Ordering::SeqCst), 3, "one model set per permit");
    }
}
