//! Turns an uploaded scan into the `[1, 3, 224, 224]` planar tensor the classifier expects.
//!
//! The image is stretched to the square input, not cropped or letterboxed, so
//! non-square scans lose their aspect ratio. Models trained on stretched inputs
//! expect exactly that; changing it shifts predictions.

use crate::error::{Error, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use std::path::Path;

pub const INPUT_SIZE: u32 = 224;
pub const INPUT_CHANNELS: usize = 3;
pub const INPUT_SHAPE: [usize; 4] = [1, INPUT_CHANNELS, INPUT_SIZE as usize, INPUT_SIZE as usize];
pub const INPUT_LEN: usize = INPUT_CHANNELS * (INPUT_SIZE as usize) * (INPUT_SIZE as usize);

/// Normalized NCHW input for a single image.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    data: Array4<f32>,
}

impl InputTensor {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }

    /// Values in memory order: the red plane, then green, then blue.
    pub fn as_slice(&self) -> &[f32] {
        // Built from a Vec in standard layout, so this is always contiguous.
        self.data.as_slice().unwrap_or(&[])
    }
}

pub fn encode(bytes: &[u8]) -> Result<InputTensor> {
    if bytes.is_empty() {
        return Err(Error::Decode("image is empty".into()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    encode_image(&img)
}

pub fn encode_file(path: &Path) -> Result<InputTensor> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Decode(format!("failed to read {}: {e}", path.display())))?;
    encode(&bytes)
}

pub fn encode_image(img: &DynamicImage) -> Result<InputTensor> {
    if img.width() == 0 || img.height() == 0 {
        return Err(Error::Decode("image has no pixels".into()));
    }
    // Alpha is dropped before resampling so transparent pixels keep their color.
    let rgb = img.to_rgb8();
    let resized = image::imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let input = rgb8_to_nchw(&resized, INPUT_SIZE, INPUT_SIZE);
    let data = Array4::from_shape_vec(INPUT_SHAPE, input)
        .map_err(|e| Error::Decode(format!("Invalid input tensor shape: {e}")))?;
    Ok(InputTensor { data })
}

fn rgb8_to_nchw(img: &RgbImage, w: u32, h: u32) -> Vec<f32> {
    let plane = (w * h) as usize;
    let mut input = vec![0.0; plane * INPUT_CHANNELS];
    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * w + x) as usize;
        input[idx] = pixel[0] as f32 / 255.0;
        input[idx + plane] = pixel[1] as f32 / 255.0;
        input[idx + plane * 2] = pixel[2] as f32 / 255.0;
    }
    input
}
