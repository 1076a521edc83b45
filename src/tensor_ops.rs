//! Shared elementwise tensor helpers used by the schedulers, the guidance
//! fusion step, and the image/latent adaptors. Grounded in the teacher
//! inpaint example's direct `Tensor` arithmetic
//! (`noise_pred_uncond + (noise_pred_text - noise_pred_uncond) * GUIDANCE_SCALE`).

use tch::Tensor;

use crate::error::{Error, Result};

/// Elementwise linear combination `sum(weights[i] * tensors[i])`.
/// Precondition: all tensors share a shape (spec §4.4 "Common helpers").
pub fn weighted_sum(weights: &[f64], tensors: &[&Tensor]) -> Result<Tensor> {
    assert_eq!(weights.len(), tensors.len(), "weighted_sum: weights/tensors length mismatch");
    let first_shape = tensors[0].size();
    for t in tensors.iter() {
        if t.size() != first_shape {
            return Err(Error::ShapeMismatch {
                context: "weighted_sum".to_string(),
                expected: first_shape,
                actual: t.size(),
            });
        }
    }
    let mut acc = tensors[0] * weights[0];
    for (w, t) in weights.iter().zip(tensors.iter()).skip(1) {
        acc = acc + *t * *w;
    }
    Ok(acc)
}

/// Standard classifier-free guidance (spec §4.7): `neg + g * (text - neg)`.
/// `noise_pred` is the CFG-doubled batch output `[negative; text]` along
/// dim 0.
pub fn apply_cfg_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Tensor {
    let chunks = noise_pred.chunk(2, 0);
    let (uncond, text) = (&chunks[0], &chunks[1]);
    uncond + (text - uncond) * guidance_scale
}

/// Instruct-pix2pix three-way guidance (spec §4.7):
/// `neg + g*(text - image) + gI*(image - neg)`. `noise_pred` is the
/// 3-way batch `[text; image; negative]` along dim 0.
pub fn apply_instruct_guidance(
    noise_pred: &Tensor,
    guidance_scale: f64,
    image_guidance_scale: f64,
) -> Tensor {
    let chunks = noise_pred.chunk(3, 0);
    let (text, image, neg) = (&chunks[0], &chunks[1], &chunks[2]);
    neg + (text - image) * guidance_scale + (image - neg) * image_guidance_scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn scalar(v: f64) -> Tensor {
        Tensor::from_slice(&[v as f32]).to_kind(Kind::Float)
    }

    #[test]
    fn cfg_with_zero_guidance_returns_negative_branch() {
        let uncond = scalar(1.0);
        let text = scalar(5.0);
        let batch = Tensor::cat(&[&uncond, &text], 0);
        let out = apply_cfg_guidance(&batch, 0.0);
        assert_eq!(f64::try_from(out).unwrap(), 1.0);
    }

    #[test]
    fn cfg_with_unit_guidance_returns_text_branch() {
        let uncond = scalar(1.0);
        let text = scalar(5.0);
        let batch = Tensor::cat(&[&uncond, &text], 0);
        let out = apply_cfg_guidance(&batch, 1.0);
        assert_eq!(f64::try_from(out).unwrap(), 5.0);
    }

    #[test]
    fn instruct_guidance_reduces_to_standard_cfg_when_image_equals_negative() {
        let text = scalar(5.0);
        let neg = scalar(1.0);
        let image = scalar(1.0); // image channel == negative channel
        let batch = Tensor::cat(&[&text, &image, &neg], 0);
        let instruct_out = apply_instruct_guidance(&batch, 7.5, 0.0);
        let cfg_batch = Tensor::cat(&[&neg, &text], 0);
        let cfg_out = apply_cfg_guidance(&cfg_batch, 7.5);
        assert!((f64::try_from(instruct_out).unwrap() - f64::try_from(cfg_out).unwrap()).abs() < 1e-6);
    }

    #[test]
    fn weighted_sum_rejects_shape_mismatch() {
        let a = Tensor::from_slice(&[1.0f32, 2.0]);
        let b = Tensor::from_slice(&[1.0f32, 2.0, 3.0]);
        let err = weighted_sum(&[1.0, 1.0], &[&a, &b]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
