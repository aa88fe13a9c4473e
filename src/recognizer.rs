//! Collaborator interfaces for the actual perception backends.
//!
//! The recognizers themselves (face matching, pose estimation models) live
//! outside this crate; the server only sees these traits and their typed
//! results.

use ndarray::Array3;

use crate::frame::ImageData;

/// BODY_25 keypoint layout: one pose is 25 keypoints of (x, y, confidence).
pub const POSE_KEYPOINTS: usize = 25;
pub const POSE_CHANNELS: usize = 3;

pub const KP_NOSE: usize = 0;
pub const KP_NECK: usize = 1;
pub const KP_MID_HIP: usize = 8;

/// Face bounding box in pixel coordinates (face_recognition order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
    pub left: i64,
}

impl BoundingBox {
    /// Box center, normalized by the source image size.
    pub fn center_normalized(&self, width: u32, height: u32) -> (f64, f64) {
        let x = (self.right + self.left) as f64 / 2.0 / width as f64;
        let y = (self.top + self.bottom) as f64 / 2.0 / height as f64;
        (x, y)
    }
}

/// One face-recognition pass: parallel id/box lists plus the dimensions of
/// the image they were detected in.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceResult {
    pub ids: Vec<i64>,
    pub boxes: Vec<BoundingBox>,
    pub width: u32,
    pub height: u32,
}

impl FaceResult {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// One pose-estimation pass: persons × 25 keypoints × (x, y, confidence),
/// with x and y normalized to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct PoseResult {
    pub keypoints: Array3<f32>,
}

impl PoseResult {
    pub fn empty() -> Self {
        Self {
            keypoints: Array3::zeros((0, POSE_KEYPOINTS, POSE_CHANNELS)),
        }
    }

    pub fn new(keypoints: Array3<f32>) -> Self {
        debug_assert_eq!(keypoints.shape()[1], POSE_KEYPOINTS);
        debug_assert_eq!(keypoints.shape()[2], POSE_CHANNELS);
        Self { keypoints }
    }

    pub fn person_count(&self) -> usize {
        self.keypoints.shape()[0]
    }

    /// (x, y, confidence) of one keypoint.
    pub fn keypoint(&self, person: usize, index: usize) -> (f64, f64, f64) {
        (
            self.keypoints[[person, index, 0]] as f64,
            self.keypoints[[person, index, 1]] as f64,
            self.keypoints[[person, index, 2]] as f64,
        )
    }

    /// An all-zero keypoint means "not detected".
    pub fn is_zero(&self, person: usize, index: usize) -> bool {
        let (x, y, c) = self.keypoint(person, index);
        x.abs() + y.abs() + c.abs() < 1e-6
    }

    /// Flatten to little-endian f32 bytes for the wire blob.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.keypoints.len() * 4);
        for v in self.keypoints.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// External face recognizer: identities plus bounding boxes for one image.
pub trait FaceRecognizer: Send + Sync {
    fn recognize(&self, image: &ImageData) -> anyhow::Result<FaceResult>;
}

/// External pose estimator producing BODY_25 keypoints per detected person.
pub trait PoseEstimator: Send + Sync {
    fn find_pose(&self, image: &ImageData) -> anyhow::Result<PoseResult>;
}
