//! Opaque safety classifier wrapper (spec §1 "out of scope... treated as
//! opaque callables with fixed I/O contracts"; §4.7 step 8). Built as a
//! thin [`ManagedModel`] wrapper, matching the shape of
//! [`crate::text_encoder::TextEncoder`] and [`crate::vae::VaeEncoder`]
//! for consistency across this crate's model-wrapper types.

use tch::{IValue, Kind, Tensor};

use crate::error::{Error, Result};
use crate::managed_model::ManagedModel;

/// Classifies a batch of decoded images as safe/unsafe. A `false` at
/// index `i` means the image at that index should be replaced with
/// `None` in the pipeline's output (spec §4.7 step 8, §7
/// "SafetyRejected").
pub struct SafetyChecker {
    model: ManagedModel,
}

impl SafetyChecker {
    pub fn new(model: ManagedModel) -> Self {
        SafetyChecker { model }
    }

    pub fn model(&self) -> &ManagedModel {
        &self.model
    }

    /// `images` is `[N,3,H,W]` in `[0,1]`. Returns one bool per image,
    /// `true` meaning safe.
    pub fn check(&self, images: &Tensor) -> Result<Vec<bool>> {
        let count = images.size()[0];
        self.model.perform(|module| {
            let output = module.forward_is(&[IValue::Tensor(images.shallow_clone())]).map_err(|source| {
                Error::InferenceFailed { name: self.model.name().to_string(), source }
            })?;
            let flags = extract_flags(output, count).ok_or_else(|| Error::ShapeMismatch {
                context: format!("{} output", self.model.name()),
                expected: vec![count],
                actual: vec![],
            })?;
            Ok(flags)
        })
    }
}

fn extract_flags(output: IValue, count: i64) -> Option<Vec<bool>> {
    let tensor = match output {
        IValue::Tensor(t) => t,
        IValue::Tuple(values) | IValue::GenericList(values) => {
            values.into_iter().find_map(|v| match v {
                IValue::Tensor(t) => Some(t),
                _ => None,
            })?
        }
        _ => return None,
    };
    if tensor.size().first().copied() != Some(count) {
        return None;
    }
    let flags: Vec<f32> = Vec::try_from(tensor.to_kind(Kind::Float).view([-1])).ok()?;
    Some(flags.into_iter().map(|v| v >= 0.5).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_flags_thresholds_at_half() {
        let scores = Tensor::from_slice(&[0.0f32, 1.0, 0.4, 0.6]);
        let flags = extract_flags(IValue::Tensor(scores), 4).unwrap();
        assert_eq!(flags, vec![false, true, false, true]);
    }

    #[test]
    fn extract_flags_rejects_count_mismatch() {
        let scores = Tensor::from_slice(&[0.0f32, 1.0]);
        assert!(extract_flags(IValue::Tensor(scores), 3).is_none());
    }
}
