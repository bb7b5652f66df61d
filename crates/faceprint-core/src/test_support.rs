//! Shared fixtures for unit tests.

use crate::inference::{check_input_shape, EngineError, InferenceEngine, ModelKind, TensorOutput};
use crate::snapshot::{BoundingBox, ContourKind, FaceDetectionSnapshot, LandmarkKind, Point};
use ndarray::ArrayView4;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 240x200 PNG with a smooth gradient and a darker "face" blob.
pub fn sample_png() -> Vec<u8> {
    let img = image::RgbImage::from_fn(240, 200, |x, y| {
        let dx = x as f32 - 120.0;
        let dy = y as f32 - 100.0;
        let inside = dx * dx / 3600.0 + dy * dy / 4900.0 < 1.0;
        let base = if inside { 150 } else { 60 };
        image::Rgb([(base + x / 4) as u8, (base + y / 4) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Complete snapshot matching the face in [`sample_png`].
pub fn sample_snapshot() -> FaceDetectionSnapshot {
    let mut snap = FaceDetectionSnapshot::new(BoundingBox::new(70.0, 40.0, 100.0, 120.0));
    let landmarks = [
        (LandmarkKind::LeftEye, 100.0, 80.0),
        (LandmarkKind::RightEye, 140.0, 80.0),
        (LandmarkKind::NoseBase, 120.0, 105.0),
        (LandmarkKind::MouthLeft, 104.0, 130.0),
        (LandmarkKind::MouthRight, 136.0, 130.0),
        (LandmarkKind::MouthBottom, 120.0, 138.0),
        (LandmarkKind::LeftCheek, 92.0, 110.0),
        (LandmarkKind::RightCheek, 148.0, 110.0),
    ];
    for (kind, x, y) in landmarks {
        snap.landmarks.insert(kind, Point::new(x, y));
    }
    for kind in ContourKind::CRITICAL {
        snap.contours
            .insert(kind, vec![Point::new(90.0, 70.0), Point::new(120.0, 65.0), Point::new(150.0, 70.0)]);
    }
    snap.left_eye_open = Some(0.9);
    snap.right_eye_open = Some(0.9);
    snap.smiling = Some(0.2);
    snap
}

/// Well-behaved engine whose outputs are a pure function of the input.
///
/// `missing` removes models; `noisy` perturbs every call differently so the
/// consistency check fails.
#[derive(Default)]
pub struct FakeEngine {
    pub missing: Vec<ModelKind>,
    pub noisy: bool,
    pub calls: AtomicUsize,
}

impl InferenceEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn supports(&self, kind: ModelKind) -> bool {
        !self.missing.contains(&kind)
    }

    fn run(&self, kind: ModelKind, input: ArrayView4<'_, f32>) -> Result<TensorOutput, EngineError> {
        if !self.supports(kind) {
            return Err(EngineError::MissingModel(kind));
        }
        check_input_shape(kind, &input)?;

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let values: Vec<f32> = input.iter().copied().collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let [_, out_len] = kind.output_shape();
        let stride = (values.len() / out_len).max(1);

        let mut data: Vec<f32> = match kind {
            ModelKind::Embedding | ModelKind::FaceAnalysis => (0..out_len)
                .map(|i| (values[i * stride] + (i as f32 * 0.37).sin()).tanh())
                .collect(),
            ModelKind::Emotion => {
                let logits: Vec<f32> = (0..out_len).map(|i| values[i * stride] + mean * i as f32).collect();
                let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
                let total: f32 = exp.iter().sum();
                exp.iter().map(|e| e / total).collect()
            }
            ModelKind::AgeGender => {
                let male = (0.5 + mean * 0.4).clamp(0.0, 1.0);
                vec![30.0 + mean * 10.0, male, 1.0 - male]
            }
        };

        if self.noisy {
            let sign = if call % 2 == 0 { 1.0 } else { -1.0 };
            for (i, v) in data.iter_mut().enumerate() {
                *v = sign * ((i + call) as f32 * 1.7).sin();
            }
        }

        Ok(TensorOutput {
            shape: kind.output_shape().to_vec(),
            data,
        })
    }
}
