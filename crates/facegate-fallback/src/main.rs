//! Default external verifier for facegate.
//!
//! Reads one JSON request `{"reference": .., "candidate": ..}` from stdin and
//! writes one JSON line to stdout. The candidate must show a face, found with
//! the SCRFD detector from `FACEGATE_MODEL_DIR`. Images are then compared by
//! colour histogram, which is an appearance heuristic only; results are
//! reported as reduced trust by the caller.

use anyhow::{Context, Result};
use facegate_core::histogram::histogram_similarity;
use facegate_core::detector::FaceDetector;
use facegate_core::image_source::payload_bytes;
use facegate_core::{default_model_dir, FrameDecoder, ImageCrateDecoder, ModelPaths};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_THRESHOLD: f32 = 50.0;
const NO_FACE_MESSAGE: &str = "No face detected in capture! Please look at the camera.";

/// Decides whether an image shows a face at all.
trait FaceCheck {
    fn has_face(&mut self, image: &RgbImage) -> Result<bool>;
}

impl FaceCheck for FaceDetector {
    fn has_face(&mut self, image: &RgbImage) -> Result<bool> {
        Ok(self.detect_best(image)?.is_some())
    }
}

/// Stands in when the detector could not be loaded; every check fails.
struct Unavailable(String);

impl FaceCheck for Unavailable {
    fn has_face(&mut self, _image: &RgbImage) -> Result<bool> {
        anyhow::bail!("face detector unavailable: {}", self.0)
    }
}

#[derive(Debug, Deserialize)]
struct Request {
    reference: String,
    #[serde(alias = "selfie")]
    candidate: String,
}

#[derive(Debug, Serialize)]
struct Response {
    #[serde(rename = "match")]
    matched: bool,
    similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn failed(error: &anyhow::Error) -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            message: None,
            error: Some(format!("{error:#}")),
        }
    }
}

fn main() -> Result<()> {
    // stdout carries the response; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let threshold = threshold_from(std::env::var("FACEGATE_FALLBACK_THRESHOLD").ok());
    let model_dir = std::env::var_os("FACEGATE_MODEL_DIR").map_or_else(default_model_dir, PathBuf::from);
    let mut faces = face_check(&model_dir);

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading request from stdin")?;

    let response = match respond(&input, threshold, faces.as_mut()) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "request could not be verified");
            Response::failed(&err)
        }
    };

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &response).context("writing response")?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

fn threshold_from(raw: Option<String>) -> f32 {
    raw.and_then(|v| v.trim().parse::<f32>().ok())
        .filter(|t| (0.0..=100.0).contains(t))
        .unwrap_or(DEFAULT_THRESHOLD)
}

fn face_check(model_dir: &std::path::Path) -> Box<dyn FaceCheck> {
    let path = ModelPaths::in_dir(model_dir).detector;
    match FaceDetector::load(&path, 1) {
        Ok(detector) => Box::new(detector),
        Err(err) => {
            tracing::error!(
                path = %path.display(),
                error = %err,
                "face detector not loaded; rejecting every request"
            );
            Box::new(Unavailable(err.to_string()))
        }
    }
}

fn respond(input: &str, threshold: f32, faces: &mut dyn FaceCheck) -> Result<Response> {
    if input.trim().is_empty() {
        anyhow::bail!("empty request");
    }
    let request: Request = serde_json::from_str(input).context("parsing request")?;

    let reference = load(&request.reference).context("reference image")?;
    let candidate = load(&request.candidate).context("candidate image")?;

    if !faces.has_face(&candidate).context("candidate face check")? {
        tracing::info!("no face in candidate capture");
        return Ok(Response {
            matched: false,
            similarity: 0.0,
            message: Some(NO_FACE_MESSAGE.to_string()),
            error: None,
        });
    }

    let similarity = histogram_similarity(&reference, &candidate);
    let matched = similarity >= threshold;
    tracing::debug!(similarity, threshold, matched, "histogram comparison");

    let message = if matched {
        format!("Appearance check passed ({similarity:.1}% histogram similarity)")
    } else {
        format!("Appearance check failed ({similarity:.1}% histogram similarity)")
    };
    Ok(Response {
        matched,
        similarity,
        message: Some(message),
        error: None,
    })
}

fn load(payload: &str) -> Result<RgbImage> {
    let bytes = payload_bytes(payload.as_bytes())?;
    Ok(ImageCrateDecoder.decode(&bytes)?.to_rgb8())
}
