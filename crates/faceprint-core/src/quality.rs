//! Capture quality scoring.
//!
//! Turns one detection snapshot plus the current capture step into eight
//! sub-scores, a weighted overall score, and user-facing issue and
//! recommendation text. Scoring never fails: internal faults degrade to a
//! neutral analysis.

use crate::snapshot::{CaptureStep, ContourKind, FaceDetectionSnapshot, LandmarkKind};
use crate::types::ImageStats;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Weights of the overall score (sum to 1.0) ---
const WEIGHT_LIGHTING: f32 = 0.20;
const WEIGHT_SHARPNESS: f32 = 0.15;
const WEIGHT_POSE: f32 = 0.20;
const WEIGHT_SYMMETRY: f32 = 0.12;
const WEIGHT_EYE_OPENNESS: f32 = 0.08;
const WEIGHT_MOUTH_VISIBILITY: f32 = 0.05;
const WEIGHT_LANDMARK_QUALITY: f32 = 0.15;
const WEIGHT_CONTOUR_COMPLETENESS: f32 = 0.05;

// --- Lighting ---
const LIGHTING_BASE: f32 = 0.8;
const EDGE_PENALTY: f32 = 0.2;
/// Face area / frame area below which the face counts as small.
const SMALL_FACE_RATIO: f32 = 0.04;
const SMALL_FACE_PENALTY: f32 = 0.2;
const DARK_LUMINANCE: f32 = 50.0;
const DARK_PENALTY: f32 = 0.3;
const BRIGHT_LUMINANCE: f32 = 210.0;
const BRIGHT_PENALTY: f32 = 0.2;

// --- Sharpness ---
const SHARPNESS_BASE: f32 = 0.7;
const RICH_LANDMARK_COUNT: usize = 6;
const RICH_LANDMARK_BONUS: f32 = 0.2;
const SPARSE_LANDMARK_COUNT: usize = 3;
const SPARSE_LANDMARK_PENALTY: f32 = 0.4;
const LARGE_FACE_RATIO: f32 = 0.15;
const FACE_SIZE_ADJUSTMENT: f32 = 0.1;

// --- Pose (degrees) ---
const CENTER_TOLERANCE_DEG: f32 = 10.0;
const CENTER_PENALTY: f32 = 0.3;
const EXPRESSION_TOLERANCE_DEG: f32 = 15.0;
const EXPRESSION_POSE_PENALTY: f32 = 0.2;
const WRONG_POSE_PENALTY: f32 = 0.5;
const SWEET_SPOT_BONUS: f32 = 0.1;
const ROLL_TOLERANCE_DEG: f32 = 15.0;
const ROLL_BASE_PENALTY: f32 = 0.3;
const ROLL_PENALTY_PER_DEG: f32 = 0.02;
const ROLL_MAX_PENALTY: f32 = 0.6;

// --- Symmetry (pixels) ---
const SYMMETRY_BASE: f32 = 0.8;
const EYE_LEVEL_THRESHOLD_PX: f32 = 20.0;
const EYE_LEVEL_PENALTY: f32 = 0.2;
const MOUTH_LEVEL_THRESHOLD_PX: f32 = 15.0;
const MOUTH_LEVEL_PENALTY: f32 = 0.15;
const UNPAIRED_PENALTY: f32 = 0.15;

// --- Eyes ---
const MIN_EYE_OPENNESS: f32 = 0.25;
const CLOSED_EYES_SCORE: f32 = 0.2;
const EYE_ASYMMETRY_THRESHOLD: f32 = 0.4;
const EYE_ASYMMETRY_PENALTY: f32 = 0.3;

// --- Mouth ---
const MOUTH_BASE: f32 = 0.8;
const MISSING_MOUTH_LANDMARK_PENALTY: f32 = 0.25;
const SMILE_BONUS_THRESHOLD: f32 = 0.7;
const SMILE_BONUS: f32 = 0.1;
const SMILE_STEP_MIN: f32 = 0.5;
const SMILE_STEP_PENALTY: f32 = 0.2;

// --- Landmarks and contours ---
const OPTIONAL_LANDMARK_BONUS: f32 = 0.05;
const POOR_RATIO: f32 = 0.6;
const MODERATE_RATIO: f32 = 0.8;
const MIN_CONTOUR_POINTS: usize = 3;
const SHORT_CONTOUR_PENALTY: f32 = 0.02;

/// Score assigned to every metric when analysis cannot be completed.
const NEUTRAL_SCORE: f32 = 0.5;

/// Result of analyzing one capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceQualityAnalysis {
    pub lighting: f32,
    pub sharpness: f32,
    pub pose: f32,
    pub symmetry: f32,
    pub eye_openness: f32,
    pub mouth_visibility: f32,
    pub landmark_quality: f32,
    pub contour_completeness: f32,
    /// Weighted combination of the eight sub-scores, in [0, 1].
    pub overall: f32,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl FaceQualityAnalysis {
    /// The degrade-gracefully result: every metric neutral plus a generic
    /// issue and recommendation.
    pub fn neutral() -> Self {
        Self {
            lighting: NEUTRAL_SCORE,
            sharpness: NEUTRAL_SCORE,
            pose: NEUTRAL_SCORE,
            symmetry: NEUTRAL_SCORE,
            eye_openness: NEUTRAL_SCORE,
            mouth_visibility: NEUTRAL_SCORE,
            landmark_quality: NEUTRAL_SCORE,
            contour_completeness: NEUTRAL_SCORE,
            overall: NEUTRAL_SCORE,
            issues: vec!["Unable to assess face quality".to_string()],
            recommendations: vec!["Hold still and try again".to_string()],
        }
    }

    /// Sub-scores by name, in weight order.
    pub fn sub_scores(&self) -> [(&'static str, f32); 8] {
        [
            ("lighting", self.lighting),
            ("sharpness", self.sharpness),
            ("pose", self.pose),
            ("symmetry", self.symmetry),
            ("eye_openness", self.eye_openness),
            ("mouth_visibility", self.mouth_visibility),
            ("landmark_quality", self.landmark_quality),
            ("contour_completeness", self.contour_completeness),
        ]
    }
}

fn weighted_overall(scores: &[f32; 8]) -> f32 {
    const WEIGHTS: [f32; 8] = [
        WEIGHT_LIGHTING,
        WEIGHT_SHARPNESS,
        WEIGHT_POSE,
        WEIGHT_SYMMETRY,
        WEIGHT_EYE_OPENNESS,
        WEIGHT_MOUTH_VISIBILITY,
        WEIGHT_LANDMARK_QUALITY,
        WEIGHT_CONTOUR_COMPLETENESS,
    ];
    WEIGHTS
        .iter()
        .zip(scores.iter())
        .map(|(w, s)| w * s)
        .sum::<f32>()
        .clamp(0.0, 1.0)
}

#[derive(Debug, Error)]
enum QualityError {
    #[error("frame has zero size ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("degenerate face bounds")]
    DegenerateBounds,
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

/// Collects issue and recommendation text in evaluation order.
#[derive(Default)]
struct Feedback {
    issues: Vec<String>,
    recommendations: Vec<String>,
}

impl Feedback {
    fn issue(&mut self, issue: impl Into<String>, recommendation: Option<&str>) {
        self.issues.push(issue.into());
        if let Some(rec) = recommendation {
            if !self.recommendations.iter().any(|r| r == rec) {
                self.recommendations.push(rec.to_string());
            }
        }
    }
}

/// Scores capture usability for biometric purposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityAnalyzer;

impl QualityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze one capture. Never fails; see [`FaceQualityAnalysis::neutral`].
    pub fn analyze(
        &self,
        snapshot: &FaceDetectionSnapshot,
        stats: &ImageStats,
        step: CaptureStep,
    ) -> FaceQualityAnalysis {
        match self.try_analyze(snapshot, stats, step) {
            Ok(analysis) => {
                tracing::debug!(
                    step = %step,
                    overall = analysis.overall,
                    issues = analysis.issues.len(),
                    "quality analyzed"
                );
                analysis
            }
            Err(e) => {
                tracing::warn!(error = %e, step = %step, "quality analysis failed; returning neutral scores");
                FaceQualityAnalysis::neutral()
            }
        }
    }

    fn try_analyze(
        &self,
        snapshot: &FaceDetectionSnapshot,
        stats: &ImageStats,
        step: CaptureStep,
    ) -> Result<FaceQualityAnalysis, QualityError> {
        validate_inputs(snapshot, stats)?;

        let mut feedback = Feedback::default();
        let scores = [
            score_lighting(snapshot, stats, &mut feedback),
            score_sharpness(snapshot, stats, &mut feedback),
            score_pose(snapshot, step, &mut feedback),
            score_symmetry(snapshot, &mut feedback),
            score_eye_openness(snapshot, step, &mut feedback),
            score_mouth_visibility(snapshot, step, &mut feedback),
            score_landmark_quality(snapshot, &mut feedback),
            score_contour_completeness(snapshot, &mut feedback),
        ]
        .map(|s| s.clamp(0.0, 1.0));

        if scores.iter().any(|s| !s.is_finite()) {
            return Err(QualityError::NonFinite("sub-score"));
        }

        let [lighting, sharpness, pose, symmetry, eye_openness, mouth_visibility, landmark_quality, contour_completeness] =
            scores;

        Ok(FaceQualityAnalysis {
            lighting,
            sharpness,
            pose,
            symmetry,
            eye_openness,
            mouth_visibility,
            landmark_quality,
            contour_completeness,
            overall: weighted_overall(&scores),
            issues: feedback.issues,
            recommendations: feedback.recommendations,
        })
    }
}

fn validate_inputs(snapshot: &FaceDetectionSnapshot, stats: &ImageStats) -> Result<(), QualityError> {
    if stats.width == 0 || stats.height == 0 {
        return Err(QualityError::EmptyFrame { width: stats.width, height: stats.height });
    }
    if !snapshot.bounds.is_finite() {
        return Err(QualityError::NonFinite("bounding box"));
    }
    if snapshot.bounds.width <= 0.0 || snapshot.bounds.height <= 0.0 {
        return Err(QualityError::DegenerateBounds);
    }
    if !snapshot.rotation.is_finite() {
        return Err(QualityError::NonFinite("head rotation"));
    }
    let probabilities = [snapshot.left_eye_open, snapshot.right_eye_open, snapshot.smiling];
    if probabilities.iter().flatten().any(|p| !p.is_finite()) {
        return Err(QualityError::NonFinite("classification probability"));
    }
    if snapshot.landmarks.values().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(QualityError::NonFinite("landmark"));
    }
    if let Some(m) = stats.mean_luminance {
        if !m.is_finite() {
            return Err(QualityError::NonFinite("luminance"));
        }
    }
    Ok(())
}

fn face_area_ratio(snapshot: &FaceDetectionSnapshot, stats: &ImageStats) -> f32 {
    snapshot.bounds.area() / stats.area()
}

fn score_lighting(snapshot: &FaceDetectionSnapshot, stats: &ImageStats, feedback: &mut Feedback) -> f32 {
    let mut score = LIGHTING_BASE;
    let b = &snapshot.bounds;

    // A box touching the frame edge usually means clipping or backlight.
    let touches_edge = b.left <= 0.0
        || b.top <= 0.0
        || b.right() >= stats.width as f32
        || b.bottom() >= stats.height as f32;
    if touches_edge {
        score -= EDGE_PENALTY;
        feedback.issue("Face is touching the edge of the frame", Some("Center your face in the frame"));
    }

    if face_area_ratio(snapshot, stats) < SMALL_FACE_RATIO {
        score -= SMALL_FACE_PENALTY;
        feedback.issue(
            "Face is too small or too far away",
            Some("Move closer to the camera"),
        );
    }

    if let Some(luma) = stats.mean_luminance {
        if luma < DARK_LUMINANCE {
            score -= DARK_PENALTY;
            feedback.issue("Image is too dark", Some("Move to a brighter area"));
        } else if luma > BRIGHT_LUMINANCE {
            score -= BRIGHT_PENALTY;
            feedback.issue("Image is overexposed", Some("Avoid direct light behind or onto your face"));
        }
    }

    score
}

fn score_sharpness(snapshot: &FaceDetectionSnapshot, stats: &ImageStats, feedback: &mut Feedback) -> f32 {
    let mut score = SHARPNESS_BASE;
    let count = snapshot.landmark_count();

    if count >= RICH_LANDMARK_COUNT {
        score += RICH_LANDMARK_BONUS;
    } else if count <= SPARSE_LANDMARK_COUNT {
        score -= SPARSE_LANDMARK_PENALTY;
        feedback.issue("Image appears blurry", Some("Hold the camera steady"));
    }

    let ratio = face_area_ratio(snapshot, stats);
    if ratio > LARGE_FACE_RATIO {
        score += FACE_SIZE_ADJUSTMENT;
    } else if ratio < SMALL_FACE_RATIO {
        score -= FACE_SIZE_ADJUSTMENT;
    }

    score
}

/// Score an angle against the accepted band of a directional step.
fn score_band(
    angle: f32,
    accepted: (f32, f32),
    sweet_spot: (f32, f32),
    step: CaptureStep,
    recommendation: &str,
    feedback: &mut Feedback,
) -> f32 {
    if angle >= accepted.0 && angle <= accepted.1 {
        if angle >= sweet_spot.0 && angle <= sweet_spot.1 {
            SWEET_SPOT_BONUS
        } else {
            0.0
        }
    } else {
        feedback.issue(format!("Incorrect pose for the '{step}' step"), Some(recommendation));
        -WRONG_POSE_PENALTY
    }
}

fn score_pose(snapshot: &FaceDetectionSnapshot, step: CaptureStep, feedback: &mut Feedback) -> f32 {
    let rot = snapshot.rotation;
    let mut score = 1.0;

    match step {
        CaptureStep::Center => {
            if rot.yaw.abs() > CENTER_TOLERANCE_DEG {
                score -= CENTER_PENALTY;
                feedback.issue("Head is turned to the side", Some("Look straight at the camera"));
            }
            if rot.pitch.abs() > CENTER_TOLERANCE_DEG {
                score -= CENTER_PENALTY;
                feedback.issue("Head is tilted up or down", Some("Look straight at the camera"));
            }
        }
        CaptureStep::Up => {
            score += score_band(rot.pitch, (-30.0, -3.0), (-20.0, -10.0), step, "Tilt your head slightly up", feedback);
        }
        CaptureStep::Down => {
            score += score_band(rot.pitch, (3.0, 30.0), (10.0, 20.0), step, "Tilt your head slightly down", feedback);
        }
        CaptureStep::Left => {
            score += score_band(rot.yaw, (-40.0, -5.0), (-25.0, -15.0), step, "Turn your head slightly to the left", feedback);
        }
        CaptureStep::Right => {
            score += score_band(rot.yaw, (5.0, 40.0), (15.0, 25.0), step, "Turn your head slightly to the right", feedback);
        }
        CaptureStep::Blink | CaptureStep::Smile | CaptureStep::Neutral => {
            if rot.yaw.abs() > EXPRESSION_TOLERANCE_DEG || rot.pitch.abs() > EXPRESSION_TOLERANCE_DEG {
                score -= EXPRESSION_POSE_PENALTY;
                feedback.issue(
                    format!("Incorrect pose for the '{step}' step"),
                    Some("Look straight at the camera"),
                );
            }
        }
    }

    if rot.roll.abs() > ROLL_TOLERANCE_DEG {
        let excess = rot.roll.abs() - ROLL_TOLERANCE_DEG;
        score -= (ROLL_BASE_PENALTY + excess * ROLL_PENALTY_PER_DEG).min(ROLL_MAX_PENALTY);
        feedback.issue("Head is tilted sideways", Some("Keep your head upright"));
    }

    score
}

fn score_symmetry(snapshot: &FaceDetectionSnapshot, feedback: &mut Feedback) -> f32 {
    let mut score = SYMMETRY_BASE;

    match (snapshot.landmark(LandmarkKind::LeftEye), snapshot.landmark(LandmarkKind::RightEye)) {
        (Some(l), Some(r)) => {
            if (l.y - r.y).abs() > EYE_LEVEL_THRESHOLD_PX {
                score -= EYE_LEVEL_PENALTY;
                feedback.issue("Eyes are not level", Some("Keep your head upright"));
            }
        }
        _ => score -= UNPAIRED_PENALTY,
    }

    match (snapshot.landmark(LandmarkKind::MouthLeft), snapshot.landmark(LandmarkKind::MouthRight)) {
        (Some(l), Some(r)) => {
            if (l.y - r.y).abs() > MOUTH_LEVEL_THRESHOLD_PX {
                score -= MOUTH_LEVEL_PENALTY;
                feedback.issue("Mouth corners are not level", Some("Relax your face and keep your head upright"));
            }
        }
        _ => score -= UNPAIRED_PENALTY,
    }

    score
}

fn score_eye_openness(snapshot: &FaceDetectionSnapshot, step: CaptureStep, feedback: &mut Feedback) -> f32 {
    let left = snapshot.left_eye_open.map(|p| p.clamp(0.0, 1.0));
    let right = snapshot.right_eye_open.map(|p| p.clamp(0.0, 1.0));

    let mean = match (left, right) {
        (Some(l), Some(r)) => (l + r) / 2.0,
        (Some(p), None) | (None, Some(p)) => p,
        (None, None) => return NEUTRAL_SCORE,
    };

    let mut score = mean;
    // Closed eyes are what the blink step asks for.
    if mean < MIN_EYE_OPENNESS && step != CaptureStep::Blink {
        score = CLOSED_EYES_SCORE;
        feedback.issue("Eyes appear closed", Some("Keep your eyes open"));
    }

    if let (Some(l), Some(r)) = (left, right) {
        if (l - r).abs() > EYE_ASYMMETRY_THRESHOLD {
            score -= EYE_ASYMMETRY_PENALTY;
            feedback.issue("One eye appears closed", Some("Open both eyes evenly"));
        }
    }

    score
}

fn score_mouth_visibility(snapshot: &FaceDetectionSnapshot, step: CaptureStep, feedback: &mut Feedback) -> f32 {
    let mut score = MOUTH_BASE;

    let missing = [LandmarkKind::MouthLeft, LandmarkKind::MouthRight, LandmarkKind::MouthBottom]
        .iter()
        .filter(|k| snapshot.landmark(**k).is_none())
        .count();
    if missing > 0 {
        score -= missing as f32 * MISSING_MOUTH_LANDMARK_PENALTY;
        feedback.issue("Mouth is not fully visible", Some("Make sure your mouth is not covered"));
    }

    if let Some(smiling) = snapshot.smiling {
        if smiling > SMILE_BONUS_THRESHOLD {
            score += SMILE_BONUS;
        }
        if step == CaptureStep::Smile && smiling < SMILE_STEP_MIN {
            score -= SMILE_STEP_PENALTY;
            feedback.issue("No smile detected", Some("Smile naturally"));
        }
    }

    score
}

fn report_ratio(ratio: f32, what: &str, feedback: &mut Feedback) {
    if ratio < POOR_RATIO {
        feedback.issue(
            format!("Poor {what} detection"),
            Some("Make sure your whole face is visible and evenly lit"),
        );
    } else if ratio < MODERATE_RATIO {
        feedback.issue(format!("Moderate {what} detection"), Some("Hold still and face the camera"));
    }
}

fn score_landmark_quality(snapshot: &FaceDetectionSnapshot, feedback: &mut Feedback) -> f32 {
    let mut detected = 0usize;
    for kind in LandmarkKind::CRITICAL {
        if snapshot.landmark(kind).is_some() {
            detected += 1;
        } else {
            feedback.issue(format!("Missing landmark: {}", kind.label()), None);
        }
    }

    let ratio = detected as f32 / LandmarkKind::CRITICAL.len() as f32;
    report_ratio(ratio, "landmark", feedback);

    let optional = LandmarkKind::OPTIONAL
        .iter()
        .filter(|k| snapshot.landmark(**k).is_some())
        .count();
    (ratio + optional as f32 * OPTIONAL_LANDMARK_BONUS).min(1.0)
}

fn score_contour_completeness(snapshot: &FaceDetectionSnapshot, feedback: &mut Feedback) -> f32 {
    let mut detected = 0usize;
    let mut short = 0usize;
    for kind in ContourKind::CRITICAL {
        let points = snapshot.contour(kind);
        if points.is_empty() {
            continue;
        }
        detected += 1;
        if points.len() < MIN_CONTOUR_POINTS {
            short += 1;
        }
    }

    let ratio = detected as f32 / ContourKind::CRITICAL.len() as f32;
    report_ratio(ratio, "contour", feedback);

    ratio - short as f32 * SHORT_CONTOUR_PENALTY
}

/// Accept/retry decision made before a capture is used.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept,
    Retry {
        issues: Vec<String>,
        recommendations: Vec<String>,
    },
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, GateDecision::Accept)
    }
}

/// Minimum overall quality a capture needs before enrollment or verification.
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    pub min_overall: f32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self { min_overall: 0.7 }
    }
}

impl QualityGate {
    pub fn new(min_overall: f32) -> Self {
        Self { min_overall }
    }

    pub fn evaluate(&self, analysis: &FaceQualityAnalysis) -> GateDecision {
        if analysis.overall >= self.min_overall {
            GateDecision::Accept
        } else {
            let mut issues = analysis.issues.clone();
            if issues.is_empty() {
                issues.push(format!(
                    "Capture quality {:.2} is below the required {:.2}",
                    analysis.overall, self.min_overall
                ));
            }
            GateDecision::Retry {
                issues,
                recommendations: analysis.recommendations.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BoundingBox, HeadRotation, Point};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const FRAME: ImageStats = ImageStats { width: 640, height: 480, mean_luminance: None };

    fn full_snapshot() -> FaceDetectionSnapshot {
        let mut snap = FaceDetectionSnapshot::new(BoundingBox::new(200.0, 120.0, 240.0, 280.0));
        let lm = [
            (LandmarkKind::LeftEye, 270.0, 200.0),
            (LandmarkKind::RightEye, 370.0, 200.0),
            (LandmarkKind::NoseBase, 320.0, 260.0),
            (LandmarkKind::MouthLeft, 280.0, 320.0),
            (LandmarkKind::MouthRight, 360.0, 320.0),
            (LandmarkKind::MouthBottom, 320.0, 340.0),
            (LandmarkKind::LeftCheek, 250.0, 280.0),
            (LandmarkKind::RightCheek, 390.0, 280.0),
        ];
        for (kind, x, y) in lm {
            snap.landmarks.insert(kind, Point::new(x, y));
        }
        for kind in ContourKind::CRITICAL {
            snap.contours.insert(
                kind,
                vec![Point::new(250.0, 200.0), Point::new(300.0, 210.0), Point::new(350.0, 200.0)],
            );
        }
        snap.left_eye_open = Some(0.9);
        snap.right_eye_open = Some(0.9);
        snap.smiling = Some(0.1);
        snap
    }

    fn assert_in_unit_range(a: &FaceQualityAnalysis) {
        for (name, s) in a.sub_scores() {
            assert!((0.0..=1.0).contains(&s), "{name} = {s} out of range");
        }
        assert!((0.0..=1.0).contains(&a.overall), "overall = {}", a.overall);
    }

    #[test]
    fn test_weights_sum_to_one() {
        let total = weighted_overall(&[1.0; 8]);
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ideal_capture_scores_high_without_issues() {
        let a = QualityAnalyzer::new().analyze(&full_snapshot(), &FRAME, CaptureStep::Center);
        assert!(a.overall >= 0.85, "overall = {}", a.overall);
        assert!(a.issues.is_empty(), "issues: {:?}", a.issues);
        assert_eq!(a.landmark_quality, 1.0);
        assert_eq!(a.contour_completeness, 1.0);
        assert_in_unit_range(&a);
    }

    #[test]
    fn test_sparse_rolled_capture_scores_low() {
        let mut snap = FaceDetectionSnapshot::new(BoundingBox::new(200.0, 120.0, 240.0, 280.0));
        snap.landmarks.insert(LandmarkKind::LeftEye, Point::new(270.0, 200.0));
        snap.landmarks.insert(LandmarkKind::NoseBase, Point::new(320.0, 260.0));
        snap.rotation = HeadRotation::new(0.0, 0.0, 25.0);
        snap.left_eye_open = Some(0.9);
        snap.right_eye_open = Some(0.9);

        let a = QualityAnalyzer::new().analyze(&snap, &FRAME, CaptureStep::Center);
        assert!(a.landmark_quality <= 0.4, "landmark_quality = {}", a.landmark_quality);
        assert!(a.pose < 1.0);
        assert!(a.issues.iter().any(|i| i.contains("tilted sideways")));
        assert!(a.overall < 0.5, "overall = {}", a.overall);
        assert!(!a.issues.is_empty());
        assert_in_unit_range(&a);
    }

    #[test]
    fn test_pose_depends_on_step() {
        let snap = full_snapshot();
        let analyzer = QualityAnalyzer::new();
        let center = analyzer.analyze(&snap, &FRAME, CaptureStep::Center);
        let left = analyzer.analyze(&snap, &FRAME, CaptureStep::Left);
        assert!(center.pose >= 0.7);
        assert!(left.pose < center.pose);
        assert!(left.issues.iter().any(|i| i.contains("Incorrect pose")));
    }

    #[test]
    fn test_directional_steps_accept_their_band() {
        let analyzer = QualityAnalyzer::new();
        let mut snap = full_snapshot();

        snap.rotation = HeadRotation::new(-20.0, 0.0, 0.0);
        let left = analyzer.analyze(&snap, &FRAME, CaptureStep::Left);
        assert_eq!(left.pose, 1.0);
        assert!(left.issues.is_empty());

        snap.rotation = HeadRotation::new(20.0, 0.0, 0.0);
        assert_eq!(analyzer.analyze(&snap, &FRAME, CaptureStep::Right).pose, 1.0);
        assert!(analyzer.analyze(&snap, &FRAME, CaptureStep::Left).pose < 1.0);

        snap.rotation = HeadRotation::new(0.0, -15.0, 0.0);
        assert_eq!(analyzer.analyze(&snap, &FRAME, CaptureStep::Up).pose, 1.0);
        assert!(analyzer.analyze(&snap, &FRAME, CaptureStep::Down).pose < 1.0);

        snap.rotation = HeadRotation::new(0.0, 15.0, 0.0);
        assert_eq!(analyzer.analyze(&snap, &FRAME, CaptureStep::Down).pose, 1.0);
    }

    #[test]
    fn test_sweet_spot_offsets_roll_penalty() {
        let analyzer = QualityAnalyzer::new();
        let mut snap = full_snapshot();
        snap.rotation = HeadRotation::new(-20.0, 0.0, 20.0);
        let sweet = analyzer.analyze(&snap, &FRAME, CaptureStep::Left).pose;
        snap.rotation = HeadRotation::new(-35.0, 0.0, 20.0);
        let edge = analyzer.analyze(&snap, &FRAME, CaptureStep::Left).pose;
        assert!(sweet > edge, "sweet {sweet} vs edge {edge}");
    }

    #[test]
    fn test_center_penalizes_yaw_and_pitch() {
        let mut snap = full_snapshot();
        snap.rotation = HeadRotation::new(25.0, -25.0, 0.0);
        let a = QualityAnalyzer::new().analyze(&snap, &FRAME, CaptureStep::Center);
        assert!((a.pose - 0.4).abs() < 1e-5, "pose = {}", a.pose);
        assert_eq!(a.issues.len(), 2);
    }

    #[test]
    fn test_lighting_penalties() {
        let analyzer = QualityAnalyzer::new();
        let mut snap = full_snapshot();
        snap.bounds = BoundingBox::new(0.0, 120.0, 240.0, 280.0);
        let edge = analyzer.analyze(&snap, &FRAME, CaptureStep::Center);
        assert!((edge.lighting - 0.6).abs() < 1e-5);
        assert!(edge.issues.iter().any(|i| i.contains("edge")));

        let mut tiny = full_snapshot();
        tiny.bounds = BoundingBox::new(300.0, 200.0, 40.0, 40.0);
        let small = analyzer.analyze(&tiny, &FRAME, CaptureStep::Center);
        assert!((small.lighting - 0.6).abs() < 1e-5);

        let dark = ImageStats { mean_luminance: Some(20.0), ..FRAME };
        let a = analyzer.analyze(&full_snapshot(), &dark, CaptureStep::Center);
        assert!((a.lighting - 0.5).abs() < 1e-5);
        assert!(a.issues.iter().any(|i| i.contains("dark")));
    }

    #[test]
    fn test_symmetry_penalties() {
        let mut snap = full_snapshot();
        snap.landmarks.insert(LandmarkKind::RightEye, Point::new(370.0, 230.0));
        snap.landmarks.insert(LandmarkKind::MouthRight, Point::new(360.0, 340.0));
        let a = QualityAnalyzer::new().analyze(&snap, &FRAME, CaptureStep::Center);
        assert!((a.symmetry - 0.45).abs() < 1e-5, "symmetry = {}", a.symmetry);
    }

    #[test]
    fn test_closed_and_uneven_eyes() {
        let analyzer = QualityAnalyzer::new();
        let mut snap = full_snapshot();
        snap.left_eye_open = Some(0.1);
        snap.right_eye_open = Some(0.1);
        let closed = analyzer.analyze(&snap, &FRAME, CaptureStep::Center);
        assert!((closed.eye_openness - 0.2).abs() < 1e-6);
        assert!(closed.issues.iter().any(|i| i.contains("closed")));

        let blink = analyzer.analyze(&snap, &FRAME, CaptureStep::Blink);
        assert!(!blink.issues.iter().any(|i| i.contains("Eyes appear closed")));

        snap.left_eye_open = Some(0.95);
        snap.right_eye_open = Some(0.3);
        let uneven = analyzer.analyze(&snap, &FRAME, CaptureStep::Center);
        assert!((uneven.eye_openness - 0.325).abs() < 1e-5, "eye = {}", uneven.eye_openness);
        assert!(uneven.issues.iter().any(|i| i.contains("One eye")));
    }

    #[test]
    fn test_missing_eye_probabilities_are_neutral() {
        let mut snap = full_snapshot();
        snap.left_eye_open = None;
        snap.right_eye_open = None;
        let a = QualityAnalyzer::new().analyze(&snap, &FRAME, CaptureStep::Center);
        assert_eq!(a.eye_openness, 0.5);
    }

    #[test]
    fn test_mouth_visibility_and_smile_step() {
        let analyzer = QualityAnalyzer::new();
        let mut snap = full_snapshot();
        snap.smiling = Some(0.9);
        let smiling = analyzer.analyze(&snap, &FRAME, CaptureStep::Smile);
        assert!((smiling.mouth_visibility - 0.9).abs() < 1e-6);

        snap.smiling = Some(0.1);
        let flat = analyzer.analyze(&snap, &FRAME, CaptureStep::Smile);
        assert!((flat.mouth_visibility - 0.6).abs() < 1e-6);
        assert!(flat.issues.iter().any(|i| i.contains("smile")));

        snap.landmarks.remove(&LandmarkKind::MouthBottom);
        let covered = analyzer.analyze(&snap, &FRAME, CaptureStep::Center);
        assert!((covered.mouth_visibility - 0.55).abs() < 1e-6);
    }

    #[test]
    fn test_landmark_issues_and_ear_bonus() {
        let analyzer = QualityAnalyzer::new();
        let mut snap = full_snapshot();
        snap.landmarks.remove(&LandmarkKind::LeftCheek);
        snap.landmarks.remove(&LandmarkKind::RightCheek);
        snap.landmarks.insert(LandmarkKind::LeftEar, Point::new(210.0, 250.0));
        let a = analyzer.analyze(&snap, &FRAME, CaptureStep::Center);
        assert!((a.landmark_quality - 0.8).abs() < 1e-6, "lq = {}", a.landmark_quality);
        assert!(a.issues.iter().any(|i| i == "Missing landmark: left cheek"));
        assert!(a.issues.iter().any(|i| i == "Moderate landmark detection"));
    }

    #[test]
    fn test_short_and_missing_contours() {
        let mut snap = full_snapshot();
        snap.contours.insert(ContourKind::NoseBridge, vec![Point::new(1.0, 1.0)]);
        snap.contours.remove(&ContourKind::Face);
        snap.contours.insert(ContourKind::NoseBottom, Vec::new());
        let a = QualityAnalyzer::new().analyze(&snap, &FRAME, CaptureStep::Center);
        let expected = 11.0 / 13.0 - 0.02;
        assert!((a.contour_completeness - expected).abs() < 1e-5, "cc = {}", a.contour_completeness);
    }

    #[test]
    fn test_invalid_input_degrades_to_neutral() {
        let analyzer = QualityAnalyzer::new();
        let mut snap = full_snapshot();
        snap.rotation.yaw = f32::NAN;
        let a = analyzer.analyze(&snap, &FRAME, CaptureStep::Center);
        assert_eq!(a, FaceQualityAnalysis::neutral());

        let a = analyzer.analyze(&full_snapshot(), &ImageStats::new(0, 0), CaptureStep::Center);
        assert_eq!(a.overall, 0.5);
        assert_eq!(a.issues.len(), 1);
        assert_eq!(a.recommendations.len(), 1);
    }

    #[test]
    fn test_gate_decision() {
        let gate = QualityGate::default();
        let good = QualityAnalyzer::new().analyze(&full_snapshot(), &FRAME, CaptureStep::Center);
        assert!(gate.evaluate(&good).is_accept());

        let neutral = FaceQualityAnalysis::neutral();
        match gate.evaluate(&neutral) {
            GateDecision::Retry { issues, recommendations } => {
                assert_eq!(issues, neutral.issues);
                assert_eq!(recommendations, neutral.recommendations);
            }
            GateDecision::Accept => panic!("neutral analysis must not pass the default gate"),
        }
    }

    #[test]
    fn test_scores_bounded_for_random_snapshots() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let analyzer = QualityAnalyzer::new();
        let steps = [
            CaptureStep::Center,
            CaptureStep::Up,
            CaptureStep::Down,
            CaptureStep::Left,
            CaptureStep::Right,
            CaptureStep::Blink,
            CaptureStep::Smile,
            CaptureStep::Neutral,
        ];

        for i in 0..500 {
            let mut snap = FaceDetectionSnapshot::new(BoundingBox::new(
                rng.gen_range(-50.0..600.0),
                rng.gen_range(-50.0..450.0),
                rng.gen_range(1.0..700.0),
                rng.gen_range(1.0..500.0),
            ));
            for kind in LandmarkKind::CRITICAL.iter().chain(LandmarkKind::OPTIONAL.iter()) {
                if rng.gen_bool(0.5) {
                    snap.landmarks.insert(*kind, Point::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)));
                }
            }
            for kind in ContourKind::CRITICAL {
                if rng.gen_bool(0.5) {
                    let n = rng.gen_range(0..6);
                    snap.contours.insert(kind, (0..n).map(|j| Point::new(j as f32, j as f32)).collect());
                }
            }
            snap.rotation = HeadRotation::new(
                rng.gen_range(-90.0..90.0),
                rng.gen_range(-90.0..90.0),
                rng.gen_range(-90.0..90.0),
            );
            if rng.gen_bool(0.8) {
                snap.left_eye_open = Some(rng.gen_range(-0.5..1.5));
                snap.right_eye_open = Some(rng.gen_range(-0.5..1.5));
                snap.smiling = Some(rng.gen_range(0.0..1.0));
            }
            let stats = ImageStats {
                mean_luminance: Some(rng.gen_range(0.0..255.0)),
                ..FRAME
            };

            let a = analyzer.analyze(&snap, &stats, steps[i % steps.len()]);
            assert_in_unit_range(&a);
        }

        let empty = FaceDetectionSnapshot::new(BoundingBox::new(10.0, 10.0, 100.0, 100.0));
        let a = analyzer.analyze(&empty, &FRAME, CaptureStep::Center);
        assert_in_unit_range(&a);
        assert_eq!(a.landmark_quality, 0.0);
        assert_eq!(a.contour_completeness, 0.0);
    }
}
