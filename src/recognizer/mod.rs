//! OCR engine interface.
//!
//! A [`Recognizer`] is a single OCR engine instance. It is owned by exactly
//! one worker slot in the [`crate::pool::WorkerPool`], which feeds it one page
//! at a time and then asks for each region of that page in turn. Engines are
//! built by a [`RecognizerFactory`], so each slot can construct (and destroy)
//! its own instance.

use std::{fmt, sync::Arc};

use schemars::JsonSchema;

use crate::prelude::*;

pub mod tesseract;

/// A rectangular area of a page image, in pixels.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
pub struct Region {
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Create a new region.
    pub const fn new(top: u32, left: u32, width: u32, height: u32) -> Self {
        Self {
            top,
            left,
            width,
            height,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.top, self.left, self.width, self.height
        )
    }
}

/// A single rasterized page.
#[derive(Debug)]
pub struct PageImage {
    /// The MIME type of our data. Normally `image/png`.
    pub mime_type: String,
    /// The encoded image data.
    pub data: Vec<u8>,
}

impl PageImage {
    /// Create a new PNG page image.
    pub fn png(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            mime_type: "image/png".to_owned(),
            data,
        })
    }
}

/// What an engine saw in one region.
#[derive(Clone, Debug, PartialEq)]
pub struct Recognition {
    /// The recognized text, trimmed.
    pub text: String,
    /// Engine confidence, from 0 to 100.
    pub confidence: f32,
}

/// The result of recognizing a single region of a page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct RegionText {
    /// The region we looked at.
    pub region: Region,
    /// The recognized text. Empty if recognition failed.
    pub text: String,
    /// Engine confidence, from 0 to 100, or -1 if recognition failed.
    pub confidence: f32,
}

impl RegionText {
    /// Placeholder used when a single region could not be recognized.
    pub fn unrecognized(region: Region) -> Self {
        Self {
            region,
            text: String::new(),
            confidence: -1.0,
        }
    }
}

/// Interface to an OCR engine instance.
#[async_trait]
pub trait Recognizer: Send + 'static {
    /// Load the page that the following [`Recognizer::recognize_region`]
    /// calls refer to.
    ///
    /// An error here fails the whole task, but the engine is expected to
    /// remain usable for the next page.
    async fn load_page(&mut self, page: &PageImage) -> Result<()>;

    /// Recognize a single region of the most recently loaded page.
    async fn recognize_region(&mut self, region: Region) -> Result<Recognition>;

    /// Release any resources held by the engine.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds [`Recognizer`] instances, one per worker slot.
#[async_trait]
pub trait RecognizerFactory: Send + Sync + 'static {
    /// Create and initialize a new engine for `lang`.
    async fn create(&self, lang: &str) -> Result<Box<dyn Recognizer>>;
}
