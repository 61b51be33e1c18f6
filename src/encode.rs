use std::io::Cursor;

use base64::Engine;
use image::{
    codecs::png::{CompressionType, FilterType, PngEncoder},
    ExtendedColorType, ImageEncoder,
};
use thiserror::Error;

use crate::latent::ImageTensor;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("cannot encode an image with {0} channels")]
    UnsupportedChannels(usize),
    #[error("image tensor contains non-finite values")]
    NonFinite,
    #[error("image is empty")]
    Empty,
    #[error("image of {0}x{1} pixels is too large")]
    TooLarge(usize, usize),
    #[error("PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),
}

/// Turns a decoded image tensor into transport-safe text.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, image: &ImageTensor) -> Result<String, EncodingError>;
}

/// PNG at best compression, then standard base64.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngBase64;

impl FrameEncoder for PngBase64 {
    fn encode(&self, image: &ImageTensor) -> Result<String, EncodingError> {
        encode_png_base64(image)
    }
}

/// Maps `[-1, 1]` to `0..=255` the way the decoder's training data was scaled.
fn to_u8(v: f32) -> u8 {
    (((v + 1.0) / 2.0).clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Interleaves a `1 × C × H × W` tensor into row-major pixel bytes.
pub fn to_pixels(image: &ImageTensor) -> Result<(Vec<u8>, u32, u32, ExtendedColorType), EncodingError> {
    let (_, channels, height, width) = image.dim();
    let color = match channels {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        n => return Err(EncodingError::UnsupportedChannels(n)),
    };
    if height == 0 || width == 0 {
        return Err(EncodingError::Empty);
    }
    if image.iter().any(|v| !v.is_finite()) {
        return Err(EncodingError::NonFinite);
    }

    let mut pixels = Vec::with_capacity(channels * height * width);
    for y in 0..height {
        for x in 0..width {
            for c in 0..channels {
                pixels.push(to_u8(image[[0, c, y, x]]));
            }
        }
    }
    let too_large = |_| EncodingError::TooLarge(width, height);
    let w = u32::try_from(width).map_err(too_large)?;
    let h = u32::try_from(height).map_err(too_large)?;
    Ok((pixels, w, h, color))
}

pub fn encode_png_base64(image: &ImageTensor) -> Result<String, EncodingError> {
    let (pixels, width, height, color) = to_pixels(image)?;
    let mut buf = Cursor::new(Vec::new());
    PngEncoder::new_with_quality(&mut buf, CompressionType::Best, FilterType::Adaptive)
        .write_image(&pixels, width, height, color)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn encodes_rgb_tensor_as_png() {
        let image = Array4::from_shape_fn((1, 3, 4, 5), |(_, c, y, x)| (c as f32 - 1.0) * (x + y) as f32 / 8.0);
        let encoded = encode_png_base64(&image).unwrap();
        // base64 of the PNG signature.
        assert!(encoded.starts_with("iVBORw0KGgo"));

        let bytes = base64::engine::general_purpose::STANDARD.decode(&encoded).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (5, 4));
        assert_eq!(decoded.get_pixel(0, 0).0, [128, 128, 128]);
    }

    #[test]
    fn pixel_mapping_clamps_and_rounds() {
        assert_eq!(to_u8(-1.0), 0);
        assert_eq!(to_u8(1.0), 255);
        assert_eq!(to_u8(3.0), 255);
        assert_eq!(to_u8(-7.0), 0);
        assert_eq!(to_u8(0.0), 128);
    }

    #[test]
    fn rejects_unencodable_tensors() {
        let four_channels = Array4::<f32>::zeros((1, 4, 2, 2));
        assert!(matches!(encode_png_base64(&four_channels), Err(EncodingError::UnsupportedChannels(4))));

        let nan = Array4::from_elem((1, 3, 2, 2), f32::NAN);
        assert!(matches!(encode_png_base64(&nan), Err(EncodingError::NonFinite)));
    }
}
