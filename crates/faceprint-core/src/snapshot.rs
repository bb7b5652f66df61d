//! Face detection snapshot: the immutable geometry handed over by the
//! upstream detector for one detection cycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 2D point in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Face bounding box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self { left, top, width, height }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Width / height, or 0.0 for a degenerate box.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height > 0.0 { self.width / self.height } else { 0.0 }
    }

    pub fn is_finite(&self) -> bool {
        self.left.is_finite() && self.top.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

/// Named anatomical landmark reported by the detector.
///
/// Declaration order is the canonical iteration order (snapshot maps are
/// `BTreeMap`s keyed by this enum), which the deterministic embedding relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkKind {
    LeftEye,
    RightEye,
    NoseBase,
    MouthLeft,
    MouthRight,
    MouthBottom,
    LeftCheek,
    RightCheek,
    LeftEar,
    RightEar,
}

impl LandmarkKind {
    /// Landmarks every usable capture is expected to expose.
    pub const CRITICAL: [LandmarkKind; 8] = [
        LandmarkKind::LeftEye,
        LandmarkKind::RightEye,
        LandmarkKind::NoseBase,
        LandmarkKind::MouthLeft,
        LandmarkKind::MouthRight,
        LandmarkKind::MouthBottom,
        LandmarkKind::LeftCheek,
        LandmarkKind::RightCheek,
    ];

    /// Landmarks that earn a small bonus when present.
    pub const OPTIONAL: [LandmarkKind; 2] = [LandmarkKind::LeftEar, LandmarkKind::RightEar];

    /// Human-readable name used in issue text.
    pub fn label(&self) -> &'static str {
        match self {
            LandmarkKind::LeftEye => "left eye",
            LandmarkKind::RightEye => "right eye",
            LandmarkKind::NoseBase => "nose base",
            LandmarkKind::MouthLeft => "left mouth corner",
            LandmarkKind::MouthRight => "right mouth corner",
            LandmarkKind::MouthBottom => "bottom lip",
            LandmarkKind::LeftCheek => "left cheek",
            LandmarkKind::RightCheek => "right cheek",
            LandmarkKind::LeftEar => "left ear",
            LandmarkKind::RightEar => "right ear",
        }
    }
}

/// Named contour polyline reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContourKind {
    Face,
    LeftEyebrowTop,
    LeftEyebrowBottom,
    RightEyebrowTop,
    RightEyebrowBottom,
    LeftEye,
    RightEye,
    UpperLipTop,
    UpperLipBottom,
    LowerLipTop,
    LowerLipBottom,
    NoseBridge,
    NoseBottom,
}

impl ContourKind {
    pub const CRITICAL: [ContourKind; 13] = [
        ContourKind::Face,
        ContourKind::LeftEyebrowTop,
        ContourKind::LeftEyebrowBottom,
        ContourKind::RightEyebrowTop,
        ContourKind::RightEyebrowBottom,
        ContourKind::LeftEye,
        ContourKind::RightEye,
        ContourKind::UpperLipTop,
        ContourKind::UpperLipBottom,
        ContourKind::LowerLipTop,
        ContourKind::LowerLipBottom,
        ContourKind::NoseBridge,
        ContourKind::NoseBottom,
    ];
}

/// Head rotation in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadRotation {
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
    #[serde(default)]
    pub roll: f32,
}

impl HeadRotation {
    pub fn new(yaw: f32, pitch: f32, roll: f32) -> Self {
        Self { yaw, pitch, roll }
    }

    pub fn is_finite(&self) -> bool {
        self.yaw.is_finite() && self.pitch.is_finite() && self.roll.is_finite()
    }
}

/// One detection result: geometry plus classifier probabilities.
///
/// Landmarks and contours the detector could not find are simply absent.
/// Probabilities are `None` when the detector ran without classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetectionSnapshot {
    pub bounds: BoundingBox,
    #[serde(default)]
    pub landmarks: BTreeMap<LandmarkKind, Point>,
    #[serde(default)]
    pub contours: BTreeMap<ContourKind, Vec<Point>>,
    #[serde(default)]
    pub rotation: HeadRotation,
    #[serde(default)]
    pub left_eye_open: Option<f32>,
    #[serde(default)]
    pub right_eye_open: Option<f32>,
    #[serde(default)]
    pub smiling: Option<f32>,
}

impl FaceDetectionSnapshot {
    /// Snapshot with only a bounding box; everything else undetected.
    pub fn new(bounds: BoundingBox) -> Self {
        Self {
            bounds,
            landmarks: BTreeMap::new(),
            contours: BTreeMap::new(),
            rotation: HeadRotation::default(),
            left_eye_open: None,
            right_eye_open: None,
            smiling: None,
        }
    }

    pub fn landmark(&self, kind: LandmarkKind) -> Option<Point> {
        self.landmarks.get(&kind).copied()
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    /// Points of a contour; empty when the contour was not detected.
    pub fn contour(&self, kind: ContourKind) -> &[Point] {
        self.contours.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Parse a snapshot from the detector's JSON form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Error)]
#[error("unknown capture step: {0}")]
pub struct UnknownStep(pub String);

/// Which pose or expression the capture flow is currently asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStep {
    Center,
    Up,
    Down,
    Left,
    Right,
    Blink,
    Smile,
    Neutral,
}

impl CaptureStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStep::Center => "center",
            CaptureStep::Up => "up",
            CaptureStep::Down => "down",
            CaptureStep::Left => "left",
            CaptureStep::Right => "right",
            CaptureStep::Blink => "blink",
            CaptureStep::Smile => "smile",
            CaptureStep::Neutral => "neutral",
        }
    }
}

impl fmt::Display for CaptureStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureStep {
    type Err = UnknownStep;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "center" => Ok(CaptureStep::Center),
            "up" => Ok(CaptureStep::Up),
            "down" => Ok(CaptureStep::Down),
            "left" => Ok(CaptureStep::Left),
            "right" => Ok(CaptureStep::Right),
            "blink" => Ok(CaptureStep::Blink),
            "smile" => Ok(CaptureStep::Smile),
            "neutral" => Ok(CaptureStep::Neutral),
            _ => Err(UnknownStep(s.to_string())),
        }
    }
}
