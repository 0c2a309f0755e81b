use facegate_core::extractor::{DEFAULT_MIN_CONFIDENCE, DEFAULT_MIN_FACE_SIZE};
use facegate_core::image_source::{DEFAULT_JPEG_QUALITY, DEFAULT_MAX_IMAGE_DIM};
use facegate_core::types::DEFAULT_MATCH_THRESHOLD;
use facegate_core::{Gate, ModelPaths, PreprocessOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Verifier configuration.
///
/// Built from defaults, then an optional TOML file, then `FACEGATE_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing the three ONNX weight files.
    pub model_dir: PathBuf,
    /// Similarity (0–100) at or above which faces match.
    pub match_threshold: f32,
    /// Detector confidence below which a capture is rejected.
    pub min_detection_confidence: f32,
    /// Minimum face box side, in preprocessed pixels.
    pub min_face_size: f32,
    /// Images are downscaled to fit inside this square before detection.
    pub max_image_dim: u32,
    /// JPEG quality used when re-encoding the bounded image.
    pub jpeg_quality: u8,
    /// Upper bound on one extraction, including the wait for a worker.
    pub extract_timeout_ms: u64,
    /// Extractions allowed to run at once. One model set is loaded per slot.
    pub max_concurrent_extractions: usize,
    /// ONNX Runtime intra-op threads per session.
    pub inference_threads: usize,
    /// External verifier executable.
    pub fallback_program: PathBuf,
    pub fallback_args: Vec<String>,
    /// Hard deadline for one external verifier run.
    pub fallback_timeout_ms: u64,
    /// External verifier processes allowed to run at once.
    pub max_concurrent_fallbacks: usize,
    /// Both payloads must exceed this many bytes for a degraded match.
    pub degraded_min_payload_bytes: usize,
    /// Whether the degraded payload-size heuristic may grant a match at all.
    pub degraded_match: bool,
}

impl Default for Config {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            model_dir: facegate_core::default_model_dir(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            min_detection_confidence: DEFAULT_MIN_CONFIDENCE,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            max_image_dim: DEFAULT_MAX_IMAGE_DIM,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            extract_timeout_ms: 8_000,
            // Each model set runs `inference_threads` (2) intra-op threads.
            max_concurrent_extractions: (cores / 2).max(1),
            inference_threads: 2,
            fallback_program: PathBuf::from("facegate-fallback"),
            fallback_args: Vec::new(),
            fallback_timeout_ms: 15_000,
            max_concurrent_fallbacks: 2,
            degraded_min_payload_bytes: 5_000,
            degraded_match: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `FACEGATE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Defaults, then the TOML file at `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply overrides from a key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        override_parsed(&get, "FACEGATE_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&get, "FACEGATE_MIN_CONFIDENCE", &mut self.min_detection_confidence);
        override_parsed(&get, "FACEGATE_MIN_FACE_SIZE", &mut self.min_face_size);
        override_parsed(&get, "FACEGATE_MAX_IMAGE_DIM", &mut self.max_image_dim);
        override_parsed(&get, "FACEGATE_JPEG_QUALITY", &mut self.jpeg_quality);
        override_parsed(&get, "FACEGATE_EXTRACT_TIMEOUT_MS", &mut self.extract_timeout_ms);
        override_parsed(&get, "FACEGATE_MAX_EXTRACTIONS", &mut self.max_concurrent_extractions);
        override_parsed(&get, "FACEGATE_INFERENCE_THREADS", &mut self.inference_threads);
        if let Some(program) = get("FACEGATE_FALLBACK_PROGRAM") {
            self.fallback_program = PathBuf::from(program);
        }
        if let Some(args) = get("FACEGATE_FALLBACK_ARGS") {
            self.fallback_args = args.split_whitespace().map(str::to_string).collect();
        }
        override_parsed(&get, "FACEGATE_FALLBACK_TIMEOUT_MS", &mut self.fallback_timeout_ms);
        override_parsed(&get, "FACEGATE_MAX_FALLBACKS", &mut self.max_concurrent_fallbacks);
        override_parsed(&get, "FACEGATE_DEGRADED_MIN_BYTES", &mut self.degraded_min_payload_bytes);
        if let Some(flag) = get("FACEGATE_DEGRADED_MATCH") {
            self.degraded_match = !matches!(flag.trim(), "0" | "false" | "off" | "no");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.match_threshold) {
            return Err(invalid("match_threshold", "must be within 0..=100"));
        }
        if !(0.0..=1.0).contains(&self.min_detection_confidence) {
            return Err(invalid("min_detection_confidence", "must be within 0..=1"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(invalid("jpeg_quality", "must be within 1..=100"));
        }
        if self.max_image_dim < 32 {
            return Err(invalid("max_image_dim", "must be at least 32"));
        }
        if self.max_concurrent_extractions == 0 || self.max_concurrent_fallbacks == 0 {
            return Err(invalid("max_concurrent_*", "must be at least 1"));
        }
        if self.inference_threads == 0 {
            return Err(invalid("inference_threads", "must be at least 1"));
        }
        if self.extract_timeout_ms == 0 || self.fallback_timeout_ms == 0 {
            return Err(invalid("*_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn gate(&self) -> Gate {
        Gate {
            min_confidence: self.min_detection_confidence,
            min_face_size: self.min_face_size,
        }
    }

    pub fn preprocess_options(&self) -> PreprocessOptions {
        PreprocessOptions {
            max_dim: self.max_image_dim,
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }
}

fn override_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = get(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}
