//! RGB <-> planar-float tensor adaptor: normalization, resize, mask
//! extraction (spec §2 "Image I/O adaptor"). Grounded on the teacher
//! inpaint example's `image / 255. * 2. - 1.` normalization literal and
//! `tch::vision::image::{load,save}` calls.

use std::path::Path;

use tch::{Kind, Tensor};

use crate::error::Result;

/// Load an RGB image from disk as `[1,3,H,W]` `u8`, the layout
/// `tch::vision::image::load` already returns (teacher's own loader).
pub fn load_rgb(path: impl AsRef<Path>) -> Result<Tensor> {
    let image = tch::vision::image::load(path.as_ref())
        .map_err(|_| crate::error::Error::ResourceMissing { path: path.as_ref().display().to_string() })?;
    Ok(image.unsqueeze(0))
}

/// Save a `[1,3,H,W]` (or `[3,H,W]`) tensor in `[0,255]` `u8` as a PNG.
pub fn save_rgb(image: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let image = if image.size().len() == 4 { image.squeeze_dim(0) } else { image.shallow_clone() };
    tch::vision::image::save(&image, path.as_ref())
        .map_err(|_| crate::error::Error::ResourceMissing { path: path.as_ref().display().to_string() })
}

/// Bilinear resize to `(height, width)`. A no-op if already that size.
pub fn resize_bilinear(image: &Tensor, height: i64, width: i64) -> Tensor {
    if image.size()[2] == height && image.size()[3] == width {
        return image.shallow_clone();
    }
    image.upsample_bilinear2d([height, width], false, None, None)
}

/// Convert a `u8` `[0,255]` or float `[0,1]` image tensor to planar
/// float32 `[-1,1]`, dropping any alpha channel (spec §4.3 step 2).
pub fn to_minus_one_one(image: &Tensor) -> Tensor {
    let float_image = if image.kind() == Kind::Uint8 { image.to_kind(Kind::Float) / 255. } else { image.shallow_clone() };
    let channels = float_image.size()[1];
    let rgb = if channels >= 3 { float_image.narrow(1, 0, 3) } else { float_image };
    rgb * 2. - 1.
}

/// Convert a planar float32 `[-1,1]` tensor back to `u8` `[0,255]`,
/// clamping (teacher's own `(image/2+0.5).clamp(0,1)` then `*255`
/// convention from the inpaint example's final decode step).
pub fn from_minus_one_one(image: &Tensor) -> Tensor {
    ((image / 2. + 0.5).clamp(0., 1.) * 255.).to_kind(Kind::Uint8)
}

/// Extract a `[1,1,h,w]` mask in `[0,1]` from a single-channel grayscale
/// mask image, treating the sole channel as already the mask values
/// (spec §4.3 "grayscale masks treated as single-channel").
pub fn mask_tensor(image: &Tensor) -> Tensor {
    let float_image = if image.kind() == Kind::Uint8 { image.to_kind(Kind::Float) / 255. } else { image.shallow_clone() };
    if float_image.size()[1] > 1 {
        float_image.mean_dim(Some([1i64].as_slice()), true, Kind::Float)
    } else {
        float_image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_tensor_averages_multichannel_input() {
        let image = Tensor::from_slice(&[0u8, 255, 128, 0, 255, 128]).view([1, 3, 1, 2]);
        let mask = mask_tensor(&image);
        assert_eq!(mask.size(), vec![1, 1, 1, 2]);
    }

    #[test]
    fn roundtrip_normalization_is_approximately_identity() {
        let original = Tensor::from_slice(&[0u8, 64, 128, 192, 255]).view([1, 1, 1, 5]);
        let original = Tensor::cat(&[&original, &original, &original], 1);
        let normalized = to_minus_one_one(&original);
        let restored = from_minus_one_one(&normalized);
        let before: Vec<u8> = Vec::try_from(original.view([-1])).unwrap();
        let after: Vec<u8> = Vec::try_from(restored.view([-1])).unwrap();
        for (b, a) in before.iter().zip(after.iter()) {
            assert!((*b as i16 - *a as i16).abs() <= 1);
        }
    }
}
