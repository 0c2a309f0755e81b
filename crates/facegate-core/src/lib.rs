//! facegate-core — face descriptor extraction and scoring.
//!
//! Three ONNX models run on CPU: SCRFD for detection, a 68-point landmark net
//! for alignment, and a MobileFaceNet encoder producing 128-d descriptors.
//! Descriptors are compared with cosine similarity on a 0–100 scale.

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod extractor;
pub mod histogram;
pub mod image_source;
pub mod landmarker;
pub mod models;
pub mod types;

pub use extractor::{extract, ExtractError, FacePipeline, Gate};
pub use image_source::{FrameDecoder, ImageCrateDecoder, ImageDataError, PreprocessOptions};
pub use models::{default_model_dir, FaceModels, ModelLoadError, ModelPaths};
pub use types::{score, BoundingBox, FaceDescriptor, Source, VerificationResult};
