//! SCRFD face detector via ONNX Runtime.
//!
//! First stage of the extraction pipeline. Anchor-free decoding over three
//! feature strides, then NMS; callers normally want only the best face.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INPUT_SIZE: usize = 320;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
/// Candidate floor. The confidence gate applied afterwards is stricter.
const CANDIDATE_FLOOR: f32 = 0.35;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector weights not found: {}", .0.display())]
    MissingWeights(PathBuf),
    #[error("unsupported detector model: {0}")]
    UnsupportedModel(String),
    #[error("bad {head} output at stride {stride}: {reason}")]
    Output {
        head: &'static str,
        stride: usize,
        reason: String,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// How letterboxed coordinates map back onto the source image.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output slots of the score, box and keypoint heads for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHeads {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw head outputs for one stride.
struct StrideOutput<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    keypoints: &'a [f32],
}

pub struct FaceDetector {
    session: Session,
    heads: [StrideHeads; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::MissingWeights(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::UnsupportedModel(format!(
                "expected 9 outputs (score, bbox and kps for 3 strides), found {}",
                names.len()
            )));
        }
        let heads = map_heads(&names);
        tracing::info!(path = %model_path.display(), ?heads, "face detector loaded");

        Ok(Self { session, heads })
    }

    /// The most confident face, if any. Ties keep the earlier detection.
    pub fn detect_best(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, DetectorError> {
        let faces = self.detect(image)?;
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), "several faces in frame; keeping the most confident");
        }
        Ok(faces.into_iter().next())
    }

    /// All faces above the candidate floor, most confident first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = letterbox(image, INPUT_SIZE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let head = |slot: usize, name: &'static str, stride: usize| {
            outputs[slot]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::Output { head: name, stride, reason: e.to_string() })
        };

        let mut candidates = Vec::new();
        for (&stride, heads) in STRIDES.iter().zip(self.heads) {
            let output = StrideOutput {
                stride,
                scores: head(heads.score, "score", stride)?,
                boxes: head(heads.bbox, "bbox", stride)?,
                keypoints: head(heads.kps, "kps", stride)?,
            };
            candidates.extend(decode_stride(&output, INPUT_SIZE, &letterbox, CANDIDATE_FLOOR));
        }

        Ok(nms(candidates, NMS_IOU))
    }
}

/// Scale to fit a `size × size` square, centre it, and lay it out as NCHW.
fn letterbox(image: &RgbImage, size: usize) -> (Array4<f32>, Letterbox) {
    let side = size as f32;
    let scale = (side / image.width() as f32).min(side / image.height() as f32);
    let fit = |v: u32| ((v as f32 * scale).round() as u32).clamp(1, size as u32);
    let (w, h) = (fit(image.width()), fit(image.height()));
    let pad_x = (size as u32 - w) as f32 / 2.0;
    let pad_y = (size as u32 - h) as f32 / 2.0;

    let resized = imageops::resize(image, w, h, FilterType::Triangle);

    // Zero is the normalized mean, so the border needs no fill.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (x0, y0) = (pad_x.floor() as usize, pad_y.floor() as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        for (c, &v) in px.0.iter().enumerate() {
            tensor[[0, c, y0 + y as usize, x0 + x as usize]] = (v as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Map output slots to strides.
///
/// Exports named `score_8`, `bbox_16`, ... are matched by name in any order;
/// anything else is assumed to use the reference layout of all scores, then
/// all boxes, then all keypoints.
fn map_heads(names: &[String]) -> [StrideHeads; 3] {
    let slot = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));
    let by_name = |stride: usize| {
        Some(StrideHeads {
            score: slot("score", stride)?,
            bbox: slot("bbox", stride)?,
            kps: slot("kps", stride)?,
        })
    };

    match (by_name(STRIDES[0]), by_name(STRIDES[1]), by_name(STRIDES[2])) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "detector outputs unnamed; using positional layout");
            std::array::from_fn(|i| StrideHeads { score: i, bbox: i + 3, kps: i + 6 })
        }
    }
}

/// Turn one stride's head outputs into image-space candidates above `floor`.
fn decode_stride(
    output: &StrideOutput<'_>,
    input_size: usize,
    letterbox: &Letterbox,
    floor: f32,
) -> Vec<BoundingBox> {
    let cols = input_size / output.stride;
    let anchors = cols * cols * ANCHORS_PER_CELL;
    let step = output.stride as f32;

    (0..anchors)
        .filter_map(|i| {
            let score = *output.scores.get(i)?;
            if score <= floor {
                return None;
            }
            let cell = i / ANCHORS_PER_CELL;
            let (cx, cy) = ((cell % cols) as f32 * step, (cell / cols) as f32 * step);

            // Distances to the left, top, right and bottom edges, in stride units.
            let d = output.boxes.get(i * 4..i * 4 + 4)?;
            let (left, top) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
            let (right, bottom) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

            let landmarks = output.keypoints.get(i * 10..i * 10 + 10).map(|k| {
                std::array::from_fn(|p| letterbox.unmap(cx + k[2 * p] * step, cy + k[2 * p + 1] * step))
            });

            Some(BoundingBox {
                x: left,
                y: top,
                width: right - left,
                height: bottom - top,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, most confident first.
fn nms(mut candidates: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    // sort_by is stable: equal scores keep decode order.
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !kept.iter().any(|k| iou(k, &candidate) > max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let overlap = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - overlap;
    if union > 0.0 {
        overlap / union
    } else {
        0.0
    }
}
