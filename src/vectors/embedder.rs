//! Image embedding models.
//!
//! [`FeatureEmbedder`] is the seam between the engine and the neural model:
//! - Decodes the image to RGB once and hands the pixels to inference
//! - L2-normalizes the output (all-zero output is returned unchanged)
//! - Batched variant that skips files which fail instead of failing the batch
//!
//! [`ImageEmbedder`] implements it with fastembed's image models.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fastembed::{ImageEmbedding, ImageInitOptions};
use image::DynamicImage;

use super::{similarity::l2_norm, Embedding};
use crate::errors::EngineError;

/// Default sub-batch size for batched inference
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Scale a vector to unit length in place. A zero vector is left as is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = l2_norm(vector);
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Decode an image file into a 3-channel RGB [`DynamicImage`].
pub fn decode_image(path: &Path) -> Result<DynamicImage, EngineError> {
    let img = image::open(path).map_err(|e| EngineError::ImageLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(match img {
        DynamicImage::ImageRgb8(_) => img,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    })
}

/// Decode an image to canonical 3-channel RGB.
pub fn decode_rgb(path: &Path) -> Result<image::RgbImage, EngineError> {
    decode_image(path).map(DynamicImage::into_rgb8)
}

/// Produces normalized feature vectors for image files.
pub trait FeatureEmbedder: Send + Sync {
    /// Identifies the model; vectors from different models are never mixed.
    fn model_id(&self) -> &str;

    /// Embed one image.
    ///
    /// Fails with `ImageLoad` when the file cannot be decoded and with
    /// `VectorProcessing` for any other failure.
    fn embed(&self, path: &Path) -> Result<Embedding, EngineError>;

    fn batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }

    /// Embed a group of images in sub-batches. Files that fail are logged
    /// and left out of the result.
    fn embed_batch(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Embedding)> {
        let mut results = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(self.batch_size().max(1)) {
            for path in chunk {
                match self.embed(path) {
                    Ok(vector) => results.push((path.clone(), vector)),
                    Err(e) => log::warn!("skipping {}: {e}", path.display()),
                }
            }
        }
        results
    }
}

/// fastembed image model wrapper.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct ImageEmbedder {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    batch_size: usize,
}

impl ImageEmbedder {
    /// Load the named model, downloading it into `cache_dir/models` on first use.
    ///
    /// Any failure here is fatal for the embedding subsystem and is reported
    /// as `AiModel`.
    pub fn new(model_name: &str, cache_dir: &Path, batch_size: usize) -> Result<Self, EngineError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EngineError::AiModel(format!("failed to create models directory: {}", e))
        })?;

        log::info!("loading image model '{model_name}'");
        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let model =
            ImageEmbedding::try_new(options).map_err(|e| EngineError::AiModel(e.to_string()))?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            batch_size: batch_size.max(1),
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::ImageEmbeddingModel, EngineError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::ImageEmbeddingModel::ClipVitB32),
            "resnet50" | "resnet-50" => Ok(fastembed::ImageEmbeddingModel::Resnet50),
            "unicom-vit-b-16" | "unicomvitb16" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB16),
            "unicom-vit-b-32" | "unicomvitb32" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB32),
            "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
                Ok(fastembed::ImageEmbeddingModel::NomicEmbedVisionV15)
            }
            _ => Err(EngineError::AiModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32, resnet50, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5",
                name
            ))),
        }
    }

    /// Run the model on already decoded images, at most one sub-batch.
    fn infer(&self, images: Vec<DynamicImage>) -> Result<Vec<Embedding>, EngineError> {
        let expected = images.len();
        let mut model = self
            .model
            .lock()
            .map_err(|e| EngineError::vector(format!("failed to acquire model lock: {}", e)))?;

        let mut vectors = model
            .embed_images(images)
            .map_err(|e| EngineError::vector(format!("inference failed: {e}")))?;

        if vectors.len() != expected {
            return Err(EngineError::vector(format!(
                "model returned {} vectors for {} images",
                vectors.len(),
                expected
            )));
        }

        for vector in vectors.iter_mut() {
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

impl FeatureEmbedder for ImageEmbedder {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, path: &Path) -> Result<Embedding, EngineError> {
        // decoded here, not inside fastembed, so unreadable files surface as ImageLoad
        let image = decode_image(path)?;

        self.infer(vec![image])?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::vector("no embedding returned"))
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_batch(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Embedding)> {
        let mut results = Vec::with_capacity(paths.len());

        for chunk in paths.chunks(self.batch_size) {
            let (decodable, images): (Vec<&PathBuf>, Vec<DynamicImage>) = chunk
                .iter()
                .filter_map(|path| match decode_image(path) {
                    Ok(image) => Some((path, image)),
                    Err(e) => {
                        log::warn!("skipping {}: {e}", path.display());
                        None
                    }
                })
                .unzip();

            if decodable.is_empty() {
                continue;
            }

            match self.infer(images) {
                Ok(vectors) => results.extend(decodable.into_iter().cloned().zip(vectors)),
                Err(e) => {
                    // the failing batch consumed its images; decode again per file
                    log::warn!("batch inference failed ({e}), retrying images one by one");
                    for path in decodable {
                        match self.embed(path) {
                            Ok(vector) => results.push((path.clone(), vector)),
                            Err(e) => log::warn!("skipping {}: {e}", path.display()),
                        }
                    }
                }
            }
        }

        results
    }
}
