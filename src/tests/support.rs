//! Shared fixtures: generated images and a deterministic stand-in model.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::EngineError;
use crate::vectors::embedder::decode_rgb;
use crate::vectors::{l2_normalize, Embedding, FeatureEmbedder};

/// Write an 8x8 single-colour PNG and return its path.
pub fn write_png(dir: &Path, name: &str, rgb: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    image::RgbImage::from_pixel(8, 8, image::Rgb(rgb))
        .save(&path)
        .expect("failed to write test image");
    path
}

/// Write bytes that carry an image extension but do not decode.
pub fn write_corrupt(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"\x89PNG\r\n\x1a\nnot really a png").expect("failed to write file");
    path
}

/// Embeds an image as its normalized mean colour plus a coarse brightness
/// histogram. Identical pixels give identical vectors.
pub struct FakeEmbedder {
    calls: AtomicUsize,
    delay: Duration,
    fail_on: Option<String>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_on: None,
        }
    }

    /// Sleep this long inside every `embed` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail inference for files with this name.
    pub fn failing_on(mut self, file_name: &str) -> Self {
        self.fail_on = Some(file_name.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FeatureEmbedder for FakeEmbedder {
    fn model_id(&self) -> &str {
        "fake"
    }

    fn embed(&self, path: &Path) -> Result<Embedding, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let rgb = decode_rgb(path)?;

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if self.fail_on.as_deref() == Some(name) {
            return Err(EngineError::vector(format!("simulated inference failure for {name}")));
        }

        let mut vector = vec![0.0f32; 7];
        let pixels = rgb.pixels().len().max(1) as f32;
        for pixel in rgb.pixels() {
            let [r, g, b] = pixel.0;
            vector[0] += r as f32 / 255.0;
            vector[1] += g as f32 / 255.0;
            vector[2] += b as f32 / 255.0;
            let brightness = (r as u32 + g as u32 + b as u32) / 3;
            vector[3 + (brightness as usize * 4 / 256)] += 1.0;
        }
        for value in vector.iter_mut() {
            *value /= pixels;
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }
}
