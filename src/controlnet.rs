//! Auxiliary residual tensors conditioned on a control image (spec
//! §4.6). Grounded on the teacher crate's own `controlnet` example
//! (declared in its `Cargo.toml` `[[example]]` list, `required-features
//! = ["clap", "imageproc"]`), confirming the teacher family already has a
//! ControlNet-preprocessing convention; reimplemented here as a
//! `ManagedModel`-backed component. Preprocessing follows the CFG-aware
//! path only (spec §9 open question): the conditioning image is
//! duplicated along the batch axis for CFG, and non-CFG callers must
//! skip that duplication explicitly rather than relying on this type to
//! detect it.

use tch::{IValue, Kind, Tensor};

use crate::error::{Error, Result};
use crate::managed_model::ManagedModel;
use crate::unet::ControlResiduals;

pub const DEFAULT_CONDITIONING_SCALE: f64 = 1.0;

/// The ControlNet component. `image` is set once via
/// [`ControlNet::set_conditioning_image`]; `predict_residuals` returns
/// `None` when no conditioning image is assigned (spec §4.6).
pub struct ControlNet {
    model: ManagedModel,
    input_size: (i64, i64),
    conditioning_scale: f64,
    conditioning_image: Option<Tensor>,
}

impl ControlNet {
    pub fn new(model: ManagedModel, input_size: (i64, i64)) -> Self {
        ControlNet { model, input_size, conditioning_scale: DEFAULT_CONDITIONING_SCALE, conditioning_image: None }
    }

    pub fn model(&self) -> &ManagedModel {
        &self.model
    }

    pub fn with_conditioning_scale(mut self, scale: f64) -> Self {
        self.conditioning_scale = scale;
        self
    }

    /// Preprocess the conditioning image once on assignment: resize to
    /// the model's declared input size, normalize to `[0,1]`, duplicate
    /// along the batch axis for CFG (spec §4.6).
    pub fn set_conditioning_image(&mut self, image: &Tensor) {
        let (h, w) = self.input_size;
        let resized = crate::image_io::resize_bilinear(image, h, w);
        let normalized = to_zero_one(&resized);
        let duplicated = Tensor::cat(&[&normalized, &normalized], 0);
        self.conditioning_image = Some(duplicated);
    }

    pub fn clear_conditioning_image(&mut self) {
        self.conditioning_image = None;
    }

    pub fn is_active(&self) -> bool {
        self.conditioning_image.is_some()
    }

    /// `predictResiduals(latents, timestep, hiddenStates) ->
    /// (down[12], mid)?` (spec §4.6). Returns `Ok(None)` when no
    /// conditioning image is set. Residuals are scaled by
    /// `conditioning_scale` elementwise.
    pub fn predict_residuals(
        &self,
        latent_model_input: &Tensor,
        timestep: i64,
        hidden_states: &Tensor,
    ) -> Result<Option<ControlResiduals>> {
        let Some(conditioning) = &self.conditioning_image else {
            return Ok(None);
        };

        let batch = latent_model_input.size()[0];
        let timestep_tensor = Tensor::full([batch], timestep, (Kind::Int64, latent_model_input.device()));

        let output = self.model.perform(|module| {
            module
                .forward_is(&[
                    IValue::Tensor(latent_model_input.shallow_clone()),
                    IValue::Tensor(timestep_tensor.shallow_clone()),
                    IValue::Tensor(hidden_states.shallow_clone()),
                    IValue::Tensor(conditioning.shallow_clone()),
                ])
                .map_err(|source| Error::InferenceFailed { name: self.model.name().to_string(), source })
        })?;

        let (mut down_blocks, mid_block) = match output {
            IValue::Tuple(mut values) if values.len() >= 2 => {
                let mid = values.pop().expect("checked len >= 2");
                let down_values = values;
                let mid_tensor = match mid {
                    IValue::Tensor(t) => t,
                    _ => {
                        return Err(Error::ShapeMismatch {
                            context: format!("{} mid-block output", self.model.name()),
                            expected: vec![],
                            actual: vec![],
                        })
                    }
                };
                let down_tensors: Option<Vec<Tensor>> = match down_values.into_iter().next() {
                    Some(IValue::GenericList(list)) => list
                        .into_iter()
                        .map(|v| match v {
                            IValue::Tensor(t) => Some(t),
                            _ => None,
                        })
                        .collect(),
                    Some(IValue::Tensor(t)) => Some(vec![t]),
                    _ => None,
                };
                let down_tensors = down_tensors.ok_or_else(|| Error::ShapeMismatch {
                    context: format!("{} down-block outputs", self.model.name()),
                    expected: vec![crate::unet::DOWN_BLOCK_RESIDUAL_COUNT as i64],
                    actual: vec![],
                })?;
                (down_tensors, mid_tensor)
            }
            _ => {
                return Err(Error::ShapeMismatch {
                    context: format!("{} output shape", self.model.name()),
                    expected: vec![],
                    actual: vec![],
                })
            }
        };

        if down_blocks.len() != crate::unet::DOWN_BLOCK_RESIDUAL_COUNT {
            return Err(Error::ShapeMismatch {
                context: format!("{} down-block residual count", self.model.name()),
                expected: vec![crate::unet::DOWN_BLOCK_RESIDUAL_COUNT as i64],
                actual: vec![down_blocks.len() as i64],
            });
        }

        for down in down_blocks.iter_mut() {
            *down = &*down * self.conditioning_scale;
        }
        let mid_block = mid_block * self.conditioning_scale;

        Ok(Some(ControlResiduals { down_blocks, mid_block }))
    }
}

/// `[0,1]` normalize, the ControlNet conditioning convention (spec §6
/// "image inputs in ... `[0,1]` (ControlNet conditioning)"), distinct
/// from the VAE encoder's `[-1,1]`.
fn to_zero_one(image: &Tensor) -> Tensor {
    if image.kind() == Kind::Uint8 {
        image.to_kind(Kind::Float) / 255.
    } else {
        image.shallow_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_until_conditioning_image_set() {
        let model = ManagedModel::new("controlnet", "/nonexistent.pt", tch::Device::Cpu);
        let controlnet = ControlNet::new(model, (512, 512));
        assert!(!controlnet.is_active());
    }

    #[test]
    fn set_conditioning_image_duplicates_along_batch() {
        let model = ManagedModel::new("controlnet", "/nonexistent.pt", tch::Device::Cpu);
        let mut controlnet = ControlNet::new(model, (4, 4));
        let image = Tensor::zeros([1, 3, 4, 4], (Kind::Float, tch::Device::Cpu));
        controlnet.set_conditioning_image(&image);
        assert!(controlnet.is_active());
        assert_eq!(controlnet.conditioning_image.as_ref().unwrap().size()[0], 2);
    }

    #[test]
    fn predict_residuals_is_none_when_inactive() {
        let model = ManagedModel::new("controlnet", "/nonexistent.pt", tch::Device::Cpu);
        let controlnet = ControlNet::new(model, (512, 512));
        let latents = Tensor::zeros([2, 4, 8, 8], (Kind::Float, tch::Device::Cpu));
        let ts = Tensor::zeros([1, 1, 1, 1], (Kind::Float, tch::Device::Cpu));
        let out = controlnet.predict_residuals(&latents, 500, &ts).unwrap();
        assert!(out.is_none());
    }
}
