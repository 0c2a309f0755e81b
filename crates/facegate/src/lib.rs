//! facegate — face verification service.
//!
//! [`Verifier`] compares a reference image against a candidate using the
//! descriptor pipeline from `facegate-core`. When that pipeline cannot produce
//! descriptors it delegates to an external verifier process, isolated and
//! bounded by [`fallback::ProcessVerifier`].

pub mod config;
pub mod fallback;
pub mod model_state;
pub mod verifier;

pub use config::{Config, ConfigError};
pub use fallback::{FallbackError, FallbackSettings, ProcessVerifier};
pub use model_state::{ModelLoader, ModelState, OnnxModelLoader};
pub use verifier::{ExtractFailure, Stage, Status, Verifier, VerifyError};
