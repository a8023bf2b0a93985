//! Pre- and post-processing around the detection and embedding networks.
//!
//! Everything here is pure so the geometry can be tested without model files.
//! Detection runs on a square letterboxed canvas: the frame is scaled to fit,
//! preserving aspect ratio, and centred with padding. Every coordinate the
//! network produces must go back through [`Letterbox::to_original`] before it
//! is used against the source frame.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use veriface_config::MultiFacePolicy;

use crate::errors::{AppError, AppResult};
use crate::faces::embedding::{BoundingBox, FaceLandmarks, FaceRegion, Point};

/// Strides scanned by SCRFD-family detectors.
pub const DETECTOR_STRIDES: [u32; 3] = [8, 16, 32];
/// Anchors per feature-map cell.
pub const ANCHORS_PER_CELL: usize = 2;
/// Candidates overlapping the best box above this IoU are the same face.
pub const SAME_FACE_IOU: f32 = 0.3;
/// Margin added on each side of the face box before cropping for embedding.
pub const CROP_MARGIN: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub input_size: u32,
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub scaled_width: u32,
    pub scaled_height: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, input_size: u32) -> Self {
        let input_size = input_size.max(1);
        let width = width.max(1);
        let height = height.max(1);
        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, input_size);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, input_size);
        Self {
            input_size,
            scale,
            pad_x: ((input_size - scaled_width) / 2) as f32,
            pad_y: ((input_size - scaled_height) / 2) as f32,
            scaled_width,
            scaled_height,
        }
    }

    pub fn to_canvas(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }

    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    pub fn render(&self, image: &RgbImage) -> RgbImage {
        let resized = imageops::resize(
            image,
            self.scaled_width,
            self.scaled_height,
            FilterType::Triangle,
        );
        let mut canvas = RgbImage::from_pixel(self.input_size, self.input_size, Rgb([0, 0, 0]));
        imageops::overlay(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
        canvas
    }
}

/// NCHW tensor of the letterboxed frame, normalized as SCRFD expects.
pub fn detector_tensor(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let canvas = letterbox.render(image);
    image_to_tensor(&canvas, 127.5, 128.0)
}

/// NCHW tensor of a face crop, normalized to [-1, 1] as ArcFace expects.
pub fn embedder_tensor(crop: &RgbImage, input_size: u32) -> Array4<f32> {
    let resized = imageops::resize(crop, input_size, input_size, FilterType::Triangle);
    image_to_tensor(&resized, 127.5, 127.5)
}

fn image_to_tensor(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] =
                (f32::from(pixel[channel]) - mean) / std;
        }
    }
    tensor
}

/// Raw outputs of one detector stride, flattened row-major.
#[derive(Debug, Clone, Copy)]
pub struct StrideOutput<'a> {
    pub stride: u32,
    pub scores: &'a [f32],
    pub boxes: &'a [f32],
    pub keypoints: Option<&'a [f32]>,
}

/// Decode every anchor clearing `min_confidence` into canvas-space regions,
/// highest score first.
pub fn decode_candidates(
    outputs: &[StrideOutput<'_>],
    input_size: u32,
    min_confidence: f32,
) -> AppResult<Vec<FaceRegion>> {
    let mut candidates = Vec::new();
    for output in outputs {
        let cells = (input_size / output.stride) as usize;
        let anchors = cells * cells * ANCHORS_PER_CELL;
        if output.scores.len() < anchors || output.boxes.len() < anchors * 4 {
            return Err(AppError::Inference {
                stage: "detector",
                message: format!(
                    "stride {} produced {} scores / {} box values, expected {} anchors",
                    output.stride,
                    output.scores.len(),
                    output.boxes.len(),
                    anchors
                ),
            });
        }
        let stride = output.stride as f32;

        for index in 0..anchors {
            let score = output.scores[index];
            if score < min_confidence {
                continue;
            }
            let cell = index / ANCHORS_PER_CELL;
            let cx = (cell % cells) as f32 * stride;
            let cy = (cell / cells) as f32 * stride;

            let distances = &output.boxes[index * 4..index * 4 + 4];
            let bounding_box = BoundingBox {
                left: cx - distances[0] * stride,
                top: cy - distances[1] * stride,
                right: cx + distances[2] * stride,
                bottom: cy + distances[3] * stride,
            };

            let landmarks = match output.keypoints {
                Some(kps) if kps.len() >= (index + 1) * 10 => {
                    let raw = &kps[index * 10..index * 10 + 10];
                    let mut points = [Point::default(); 5];
                    for (slot, point) in points.iter_mut().enumerate() {
                        point.x = cx + raw[slot * 2] * stride;
                        point.y = cy + raw[slot * 2 + 1] * stride;
                    }
                    FaceLandmarks::from_points(points)
                }
                _ => landmarks_from_box(&bounding_box),
            };

            candidates.push(FaceRegion {
                bounding_box,
                score,
                landmarks,
            });
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(candidates)
}

/// Canonical landmark placement for detectors without a keypoint head.
fn landmarks_from_box(bbox: &BoundingBox) -> FaceLandmarks {
    let at = |fx: f32, fy: f32| Point {
        x: bbox.left + bbox.width() * fx,
        y: bbox.top + bbox.height() * fy,
    };
    FaceLandmarks {
        left_eye: at(0.34, 0.46),
        right_eye: at(0.66, 0.46),
        nose: at(0.5, 0.64),
        mouth_left: at(0.37, 0.82),
        mouth_right: at(0.63, 0.82),
    }
}

pub fn map_to_original(
    region: &FaceRegion,
    letterbox: &Letterbox,
    width: u32,
    height: u32,
) -> FaceRegion {
    let max_x = width as f32;
    let max_y = height as f32;
    let (left, top) = letterbox.to_original(region.bounding_box.left, region.bounding_box.top);
    let (right, bottom) =
        letterbox.to_original(region.bounding_box.right, region.bounding_box.bottom);

    let map_point = |point: Point| {
        let (x, y) = letterbox.to_original(point.x, point.y);
        Point { x, y }
    };
    let points = region.landmarks.points().map(map_point);

    FaceRegion {
        bounding_box: BoundingBox {
            left: left.clamp(0.0, max_x),
            top: top.clamp(0.0, max_y),
            right: right.clamp(0.0, max_x),
            bottom: bottom.clamp(0.0, max_y),
        },
        score: region.score,
        landmarks: FaceLandmarks::from_points(points),
    }
}

/// Pick the face of interest from score-ordered candidates.
///
/// The highest-scoring anchor wins. Overlapping anchors are folded into the
/// face they belong to. Any other face scoring at least `ambiguity_ratio`
/// of the best is resolved by `policy`.
pub fn select_region(
    candidates: &[FaceRegion],
    policy: MultiFacePolicy,
    ambiguity_ratio: f32,
    width: u32,
    height: u32,
) -> AppResult<Option<FaceRegion>> {
    let mut faces: Vec<FaceRegion> = Vec::new();
    for candidate in candidates {
        let overlaps = faces
            .iter()
            .any(|kept| kept.bounding_box.iou(&candidate.bounding_box) >= SAME_FACE_IOU);
        if !overlaps {
            faces.push(*candidate);
        }
    }

    let Some(best) = faces.first().copied() else {
        return Ok(None);
    };

    let strong: Vec<FaceRegion> = faces
        .iter()
        .copied()
        .filter(|face| face.score >= best.score * ambiguity_ratio)
        .collect();
    if strong.len() == 1 {
        return Ok(Some(best));
    }

    let frame_center = Point {
        x: width as f32 / 2.0,
        y: height as f32 / 2.0,
    };
    let chosen = match policy {
        MultiFacePolicy::Reject => {
            return Err(AppError::AmbiguousFace {
                count: strong.len(),
            })
        }
        MultiFacePolicy::HighestScore => best,
        MultiFacePolicy::Largest => strong
            .iter()
            .copied()
            .fold(best, |acc, face| {
                if face.bounding_box.area() > acc.bounding_box.area() {
                    face
                } else {
                    acc
                }
            }),
        MultiFacePolicy::MostCentral => {
            let distance = |face: &FaceRegion| {
                let center = face.bounding_box.center();
                (center.x - frame_center.x).powi(2) + (center.y - frame_center.y).powi(2)
            };
            strong.iter().copied().fold(best, |acc, face| {
                if distance(&face) < distance(&acc) {
                    face
                } else {
                    acc
                }
            })
        }
    };
    Ok(Some(chosen))
}

/// Crop `bbox` with [`CROP_MARGIN`] on every side, clamped to the frame.
pub fn crop_with_margin(image: &RgbImage, bbox: &BoundingBox) -> AppResult<RgbImage> {
    let (width, height) = image.dimensions();
    let margin_x = bbox.width() * CROP_MARGIN;
    let margin_y = bbox.height() * CROP_MARGIN;
    let left = (bbox.left - margin_x).floor().clamp(0.0, width as f32) as u32;
    let top = (bbox.top - margin_y).floor().clamp(0.0, height as f32) as u32;
    let right = (bbox.right + margin_x).ceil().clamp(0.0, width as f32) as u32;
    let bottom = (bbox.bottom + margin_y).ceil().clamp(0.0, height as f32) as u32;

    if right <= left || bottom <= top {
        return Err(AppError::Inference {
            stage: "crop",
            message: format!(
                "face box ({:.1},{:.1})-({:.1},{:.1}) lies outside the {}x{} frame",
                bbox.left, bbox.top, bbox.right, bbox.bottom, width, height
            ),
        });
    }

    Ok(imageops::crop_imm(image, left, top, right - left, bottom - top).to_image())
}
