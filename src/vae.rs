//! VAE encoder and decoder (spec §4.3). Grounded on the teacher inpaint
//! example's `vae.encode(...).sample()` / `vae.decode(...)` calls and the
//! `0.18215` scale-factor literal; reparameterization here takes an
//! injected RNG rather than `tch`'s own global generator, since the
//! pipeline — not the VAE — owns the seed budget (spec §9 "RNG
//! injection").

use tch::{IValue, Kind, Tensor};

use crate::error::{Error, Result};
use crate::managed_model::ManagedModel;
use crate::rng::SeededRng;

pub const DEFAULT_SCALE_FACTOR: f64 = 0.18215;

/// Image -> latent via diagonal-Gaussian reparameterization (spec §4.3).
pub struct VaeEncoder {
    model: ManagedModel,
    input_size: (i64, i64),
}

impl VaeEncoder {
    pub fn new(model: ManagedModel, input_size: (i64, i64)) -> Self {
        VaeEncoder { model, input_size }
    }

    pub fn model(&self) -> &ManagedModel {
        &self.model
    }

    /// Spec §4.3 steps 1-6: resize, normalize to `[-1,1]`, run the model,
    /// split `(mean, logvar)`, clamp `logvar`, sample, scale.
    pub fn encode(&self, image: &Tensor, scale_factor: f64, rng: &mut SeededRng) -> Result<Tensor> {
        let (h, w) = self.input_size;
        let resized = crate::image_io::resize_bilinear(image, h, w);
        let normalized = crate::image_io::to_minus_one_one(&resized);

        let raw = self.model.perform(|module| {
            let output = module.forward_is(&[IValue::Tensor(normalized.shallow_clone())]).map_err(|source| {
                Error::InferenceFailed { name: self.model.name().to_string(), source }
            })?;
            single_tensor(output).ok_or_else(|| Error::ShapeMismatch {
                context: format!("{} output", self.model.name()),
                expected: vec![1, 8, -1, -1],
                actual: vec![],
            })
        })?;

        let channels = raw.size()[1];
        if channels != 8 {
            return Err(Error::ShapeMismatch {
                context: "VaeEncoder output channels".to_string(),
                expected: vec![1, 8, -1, -1],
                actual: raw.size(),
            });
        }
        let mean = raw.narrow(1, 0, 4);
        let logvar = raw.narrow(1, 4, 4).clamp(-30.0, 20.0);
        let std = (&logvar * 0.5).exp();

        let latent = rng.normal_like(&mean, &std);
        Ok(latent * scale_factor)
    }

    /// Extract a `[1,1,h,w]` mask in `[0,1]` from `image`'s alpha channel
    /// (spec §4.3 `alphaTensor`). `image` is `[1,4,H,W]` (RGBA); channel 3
    /// is alpha already in `[0,1]`.
    pub fn alpha_tensor(&self, image: &Tensor) -> Result<Tensor> {
        let channels = image.size()[1];
        if channels < 4 {
            return Err(Error::ShapeMismatch {
                context: "alpha_tensor: image has no alpha channel".to_string(),
                expected: vec![1, 4, -1, -1],
                actual: image.size(),
            });
        }
        Ok(image.narrow(1, 3, 1))
    }
}

/// Latent -> RGB image (spec §4.3 "VAE Decoder").
pub struct VaeDecoder {
    model: ManagedModel,
}

impl VaeDecoder {
    pub fn new(model: ManagedModel) -> Self {
        VaeDecoder { model }
    }

    pub fn model(&self) -> &ManagedModel {
        &self.model
    }

    /// Decode `latent / scale_factor` to an image tensor in `[-1,1]`;
    /// callers normalize to `[0,1]`/`u8` at the image-I/O boundary.
    pub fn decode(&self, latent: &Tensor, scale_factor: f64) -> Result<Tensor> {
        let unscaled = latent / scale_factor;
        self.model.perform(|module| {
            let output = module.forward_is(&[IValue::Tensor(unscaled.shallow_clone())]).map_err(|source| {
                Error::InferenceFailed { name: self.model.name().to_string(), source }
            })?;
            single_tensor(output).ok_or_else(|| Error::ShapeMismatch {
                context: format!("{} output", self.model.name()),
                expected: vec![1, 3, -1, -1],
                actual: vec![],
            })
        })
    }
}

fn single_tensor(output: IValue) -> Option<Tensor> {
    match output {
        IValue::Tensor(t) => Some(t),
        IValue::Tuple(values) | IValue::GenericList(values) => values.into_iter().find_map(single_tensor),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_tensor_rejects_rgb_without_alpha() {
        let model = ManagedModel::new("vae-enc", "/nonexistent.pt", tch::Device::Cpu);
        let encoder = VaeEncoder::new(model, (512, 512));
        let rgb = Tensor::zeros([1, 3, 8, 8], (Kind::Float, tch::Device::Cpu));
        let err = encoder.alpha_tensor(&rgb).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn alpha_tensor_extracts_fourth_channel() {
        let model = ManagedModel::new("vae-enc", "/nonexistent.pt", tch::Device::Cpu);
        let encoder = VaeEncoder::new(model, (512, 512));
        let rgba = Tensor::zeros([1, 4, 2, 2], (Kind::Float, tch::Device::Cpu));
        let alpha = encoder.alpha_tensor(&rgba).unwrap();
        assert_eq!(alpha.size(), vec![1, 1, 2, 2]);
    }

    #[test]
    fn to_minus_one_one_maps_byte_range() {
        let img = Tensor::from_slice(&[0u8, 255, 128]).view([1, 3, 1, 1]);
        let out = crate::image_io::to_minus_one_one(&img);
        let values: Vec<f32> = Vec::try_from(out.view([-1])).unwrap();
        assert!((values[0] - (-1.0)).abs() < 1e-4);
        assert!((values[1] - 1.0).abs() < 1e-4);
    }
}
