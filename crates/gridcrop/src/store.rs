//! Worker-side state, keyed by image handle.
//!
//! Holds the decoded image, the last posted config and the reified geometry
//! derived from both. Posting a new image or config for a handle drops the
//! reified geometry; it is rebuilt on the next extraction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bridge::protocol::{ImageHandle, ImageSource};
use crate::extract::{ImageCodec, ImageCrateCodec, PixelBuffer, extract_region};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::geometry::{ExtractConfig, ReifiedConfig, Vec2};
use crate::worker::WorkerConfig;

/// Errors that abort the worker. Missing state is not an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("box index {idx} out of range for {handle} ({count} boxes)")]
    BoxIndexOutOfRange {
        handle: ImageHandle,
        idx: usize,
        count: usize,
    },
}

pub struct Store {
    images: HashMap<ImageHandle, PixelBuffer>,
    configs: HashMap<ImageHandle, ExtractConfig>,
    reified: HashMap<ImageHandle, ReifiedConfig>,
    codec: Arc<dyn ImageCodec>,
    fetcher: Arc<dyn Fetcher>,
}

impl Store {
    pub fn new(codec: Arc<dyn ImageCodec>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            images: HashMap::new(),
            configs: HashMap::new(),
            reified: HashMap::new(),
            codec,
            fetcher,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            Arc::new(ImageCrateCodec::new(config.output_format)),
            Arc::new(HttpFetcher::new(config.fetch_timeout)),
        )
    }

    /// Fetches (for locators) and decodes an image, replacing whatever the
    /// handle held. Returns `false` and leaves the store untouched on failure.
    pub async fn register_image(&mut self, handle: ImageHandle, source: ImageSource) -> bool {
        let bytes = match source {
            ImageSource::Bytes(blob) => blob.into_bytes(),
            ImageSource::Locator(locator) => match self.fetcher.fetch(&locator).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(%handle, error = %e, "Failed to fetch image");
                    return false;
                }
            },
        };

        let buffer = match self.codec.decode(&bytes) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(%handle, error = %e, "Failed to decode image");
                return false;
            }
        };

        tracing::debug!(
            %handle,
            width = buffer.width(),
            height = buffer.height(),
            "Stored new image"
        );
        self.images.insert(handle, buffer);
        self.reified.remove(&handle);
        true
    }

    /// Replaces the handle's config. No deduplication happens here.
    pub fn register_config(&mut self, handle: ImageHandle, config: ExtractConfig) {
        tracing::debug!(%handle, boxes = config.model.box_count(), "Stored new config");
        self.configs.insert(handle, config);
        self.reified.remove(&handle);
    }

    /// Crops and encodes box `idx` of the handle's current config.
    ///
    /// `Ok(None)` when the handle lacks an image or config, or when the box
    /// clips to nothing. An index past the template's last box is an error.
    pub fn extract_box(
        &mut self,
        handle: ImageHandle,
        idx: usize,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let (Some(image), Some(config)) = (self.images.get(&handle), self.configs.get(&handle))
        else {
            tracing::debug!(%handle, idx, "Extract requested without image or config");
            return Ok(None);
        };

        let reified = self.reified.entry(handle).or_insert_with(|| {
            tracing::trace!(%handle, "Reifying config");
            let image_size = Vec2(f64::from(image.width()), f64::from(image.height()));
            ReifiedConfig::new(config, image_size)
        });

        let Some(rect) = reified.box_rect(idx) else {
            return Err(StoreError::BoxIndexOutOfRange {
                handle,
                idx,
                count: reified.model.box_count(),
            });
        };
        tracing::trace!(%handle, idx, x = rect.top_left.x(), y = rect.top_left.y(), "Box position");

        let pads = config.pads.unwrap_or_default();
        Ok(extract_region(image, &rect, &pads, self.codec.as_ref()))
    }

    pub fn has_image(&self, handle: ImageHandle) -> bool {
        self.images.contains_key(&handle)
    }

    pub fn has_config(&self, handle: ImageHandle) -> bool {
        self.configs.contains_key(&handle)
    }

    /// Whether reified geometry is currently memoized for `handle`.
    pub fn is_reified(&self, handle: ImageHandle) -> bool {
        self.reified.contains_key(&handle)
    }
}
