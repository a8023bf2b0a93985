use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::{AppError, AppResult};

/// L2-normalized identity embedding. Cloning shares the underlying buffer.
#[derive(Clone, PartialEq)]
pub struct FaceEmbedding {
    values: Arc<[f32]>,
}

impl FaceEmbedding {
    /// Normalizes `values` to unit length. Empty, non-finite or zero-magnitude
    /// vectors are rejected.
    pub fn from_raw(values: Vec<f32>) -> AppResult<Self> {
        if values.is_empty() {
            return Err(AppError::InvalidEmbedding("embedding vector is empty".into()));
        }
        if values.iter().any(|value| !value.is_finite()) {
            return Err(AppError::InvalidEmbedding(
                "embedding contains non-finite values".into(),
            ));
        }

        let magnitude = values
            .iter()
            .map(|value| f64::from(*value) * f64::from(*value))
            .sum::<f64>()
            .sqrt();
        if magnitude <= f64::EPSILON {
            return Err(AppError::InvalidEmbedding(
                "embedding has zero magnitude".into(),
            ));
        }

        let normalized: Vec<f32> = values
            .iter()
            .map(|value| (f64::from(*value) / magnitude) as f32)
            .collect();
        Ok(Self {
            values: normalized.into(),
        })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Base64 of the little-endian `f32` components.
    pub fn to_encoded(&self) -> String {
        let mut bytes = Vec::with_capacity(self.values.len() * 4);
        for value in self.values.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        general_purpose::STANDARD.encode(bytes)
    }

    pub fn from_encoded(encoded: &str) -> AppResult<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| AppError::InvalidEmbedding(format!("invalid base64: {err}")))?;
        if bytes.len() % 4 != 0 {
            return Err(AppError::InvalidEmbedding(format!(
                "encoded length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        // Stored vectors are already unit length; keep them bit-exact.
        let magnitude = values
            .iter()
            .map(|value| f64::from(*value) * f64::from(*value))
            .sum::<f64>()
            .sqrt();
        if values.iter().all(|value| value.is_finite()) && (magnitude - 1.0).abs() < 1e-4 {
            return Ok(Self {
                values: values.into(),
            });
        }
        Self::from_raw(values)
    }
}

impl fmt::Debug for FaceEmbedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceEmbedding")
            .field("dim", &self.values.len())
            .finish()
    }
}

impl Serialize for FaceEmbedding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_encoded())
    }
}

impl<'de> Deserialize<'de> for FaceEmbedding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        FaceEmbedding::from_encoded(&encoded).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point {
        Point {
            x: (self.left + self.right) / 2.0,
            y: (self.top + self.bottom) / 2.0,
        }
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Five-point landmark set in detector order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct FaceLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub mouth_left: Point,
    pub mouth_right: Point,
}

impl FaceLandmarks {
    pub fn points(&self) -> [Point; 5] {
        [
            self.left_eye,
            self.right_eye,
            self.nose,
            self.mouth_left,
            self.mouth_right,
        ]
    }

    pub fn from_points(points: [Point; 5]) -> Self {
        Self {
            left_eye: points[0],
            right_eye: points[1],
            nose: points[2],
            mouth_left: points[3],
            mouth_right: points[4],
        }
    }
}

/// A detected face in original-frame coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FaceRegion {
    pub bounding_box: BoundingBox,
    pub score: f32,
    pub landmarks: FaceLandmarks,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_normalizes_to_unit_length() {
        let embedding = FaceEmbedding::from_raw(vec![3.0, 4.0]).unwrap();
        let values = embedding.as_slice();
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_magnitude_is_rejected() {
        let err = FaceEmbedding::from_raw(vec![0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, AppError::InvalidEmbedding(_)));
    }

    #[test]
    fn encoded_string_round_trips() {
        let raw: Vec<f32> = (0..128).map(|i| ((i * 37) % 11) as f32 - 5.0).collect();
        let embedding = FaceEmbedding::from_raw(raw).unwrap();
        let encoded = embedding.to_encoded();
        let decoded = FaceEmbedding::from_encoded(&encoded).unwrap();
        assert_eq!(decoded.dim(), 128);
        for (a, b) in embedding.as_slice().iter().zip(decoded.as_slice()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn truncated_encoding_is_rejected() {
        let encoded = general_purpose::STANDARD.encode([0u8, 0, 128]);
        let err = FaceEmbedding::from_encoded(&encoded).unwrap_err();
        assert!(matches!(err, AppError::InvalidEmbedding(_)));
    }

    #[test]
    fn serde_uses_encoded_form() {
        let embedding = FaceEmbedding::from_raw(vec![1.0, 0.0]).unwrap();
        let json = serde_json::to_string(&embedding).unwrap();
        assert!(json.starts_with('"'));
        let back: FaceEmbedding = serde_json::from_str(&json).unwrap();
        assert_eq!(back, embedding);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox {
            left: 0.0,
            top: 0.0,
            right: 10.0,
            bottom: 10.0,
        };
        let b = BoundingBox {
            left: 20.0,
            top: 20.0,
            right: 30.0,
            bottom: 30.0,
        };
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }
}
