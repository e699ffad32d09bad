//! Camera - intrinsics shared by one or more images.

use serde::{Deserialize, Serialize};

use super::types::CameraId;

/// A camera with its (possibly refined) intrinsic parameters.
///
/// The parameter layout is owned by the camera model named in `model`; the
/// mapping controller never interprets it beyond the focal length sanity
/// check below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: CameraId,

    /// Camera model name, e.g. `SIMPLE_RADIAL`.
    pub model: String,

    pub width: u32,
    pub height: u32,

    /// Model parameters. By convention the first entry is the focal length.
    pub params: Vec<f64>,

    /// Whether `params` came from a calibration rather than a guess.
    pub has_prior_focal_length: bool,
}

impl Camera {
    pub fn new(id: CameraId, model: impl Into<String>, width: u32, height: u32, params: Vec<f64>) -> Self {
        Self {
            id,
            model: model.into(),
            width,
            height,
            params,
            has_prior_focal_length: false,
        }
    }

    pub fn focal_length(&self) -> Option<f64> {
        self.params.first().copied()
    }

    /// Ratio of focal length to the larger image dimension.
    pub fn focal_length_ratio(&self) -> Option<f64> {
        let max_dim = self.width.max(self.height);
        if max_dim == 0 {
            return None;
        }
        self.focal_length().map(|f| f / max_dim as f64)
    }

    /// Whether the focal length ratio lies in `[min_ratio, max_ratio]`.
    pub fn has_bogus_focal_length(&self, min_ratio: f64, max_ratio: f64) -> bool {
        match self.focal_length_ratio() {
            Some(ratio) => ratio < min_ratio || ratio > max_ratio,
            None => true,
        }
    }
}
