//! Scheduler state machines (spec §4.4) and the sampling request type
//! (spec §3 "SampleInput"). The scheduler set is closed and small, so it
//! is modeled as a sum type dispatched at the sampling loop (spec §9
//! "Scheduler polymorphism") rather than an open `dyn Trait`.

pub mod beta_schedule;
pub mod dpm_solver_multistep;
pub mod pndm;

use tch::Tensor;

use crate::error::{Error, Result};
pub use beta_schedule::BetaSchedule;
pub use dpm_solver_multistep::DpmSolverMultistepScheduler;
pub use pndm::PlmsScheduler;

/// Which scheduler a [`SampleInput`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Plms,
    DpmPlusPlus,
}

/// The training-time beta schedule constants every scheduler shares,
/// factored out so `Scheduler::new` doesn't repeat five positional
/// arguments at every call site.
#[derive(Debug, Clone, Copy)]
pub struct NoiseScheduleConfig {
    pub train_timesteps: usize,
    pub beta_schedule: BetaSchedule,
    pub beta_start: f64,
    pub beta_end: f64,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        NoiseScheduleConfig {
            train_timesteps: 1000,
            beta_schedule: BetaSchedule::ScaledLinear,
            beta_start: 0.00085,
            beta_end: 0.012,
        }
    }
}

/// Closed sum type over the two scheduler state machines this crate
/// supports. One instance per image in a batch (spec §4.4, §5).
pub enum Scheduler {
    Plms(PlmsScheduler),
    DpmSolverMultistep(DpmSolverMultistepScheduler),
}

impl Scheduler {
    pub fn new(kind: SchedulerKind, step_count: usize, config: NoiseScheduleConfig, strength: Option<f64>) -> Self {
        match kind {
            SchedulerKind::Plms => Scheduler::Plms(PlmsScheduler::new(
                step_count,
                config.train_timesteps,
                config.beta_schedule,
                config.beta_start,
                config.beta_end,
                strength,
            )),
            SchedulerKind::DpmPlusPlus => Scheduler::DpmSolverMultistep(DpmSolverMultistepScheduler::new(
                step_count,
                config.train_timesteps,
                config.beta_schedule,
                config.beta_start,
                config.beta_end,
                strength,
            )),
        }
    }

    pub fn time_steps(&self) -> &[i64] {
        match self {
            Scheduler::Plms(s) => s.time_steps(),
            Scheduler::DpmSolverMultistep(s) => s.time_steps(),
        }
    }

    pub fn step(&mut self, model_output: &Tensor, t: i64, sample: &Tensor) -> Tensor {
        match self {
            Scheduler::Plms(s) => s.step(model_output, t, sample),
            Scheduler::DpmSolverMultistep(s) => s.step(model_output, t, sample),
        }
    }

    fn initial_alpha_cumprod(&self) -> f64 {
        match self {
            Scheduler::Plms(s) => s.initial_alpha_cumprod(),
            Scheduler::DpmSolverMultistep(s) => s.initial_alpha_cumprod(),
        }
    }

    /// Spec §4.4 "Common helpers" `addNoise`: noise the clean latent to
    /// the first (latest/noisiest) scheduled timestep —
    /// `sqrt(alpha_t)*sample + sqrt(1-alpha_t)*noise`. Identity when
    /// `alpha_t == 1` (spec §8 property 4).
    pub fn add_noise(&self, original_sample: &Tensor, noise: &Tensor) -> Tensor {
        let alpha_t = self.initial_alpha_cumprod();
        original_sample * alpha_t.sqrt() + noise * (1.0 - alpha_t).sqrt()
    }
}

/// An immutable sampling request (spec §3). Constructed only through
/// [`SampleInput::new`], which checks the cross-field invariants once so
/// every downstream consumer can treat them as given facts.
pub struct SampleInput {
    pub prompt: String,
    pub negative_prompt: String,
    pub init_image: Option<Tensor>,
    pub strength: Option<f64>,
    pub inpaint_mask: Option<Tensor>,
    pub seed: u32,
    pub step_count: usize,
    pub guidance_scale: f64,
    pub image_guidance_scale: Option<f64>,
    pub scheduler: SchedulerKind,
}

impl SampleInput {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prompt: impl Into<String>,
        negative_prompt: impl Into<String>,
        init_image: Option<Tensor>,
        strength: Option<f64>,
        inpaint_mask: Option<Tensor>,
        seed: u32,
        step_count: usize,
        guidance_scale: f64,
        image_guidance_scale: Option<f64>,
        scheduler: SchedulerKind,
    ) -> Result<Self> {
        if let Some(s) = strength {
            if !(0.0..=1.0).contains(&s) {
                return Err(Error::InvalidInput { reason: format!("strength must be in [0,1], got {s}") });
            }
        }
        if inpaint_mask.is_some() {
            if init_image.is_none() {
                return Err(Error::InvalidInput {
                    reason: "inpaintMask requires initImage".to_string(),
                });
            }
            if strength.is_some() {
                return Err(Error::InvalidInput {
                    reason: "strength must be absent when inpaintMask is set".to_string(),
                });
            }
        }
        if image_guidance_scale.is_some() && init_image.is_none() {
            return Err(Error::InvalidInput {
                reason: "imageGuidanceScale requires initImage".to_string(),
            });
        }
        Ok(SampleInput {
            prompt: prompt.into(),
            negative_prompt: negative_prompt.into(),
            init_image,
            strength,
            inpaint_mask,
            seed,
            step_count,
            guidance_scale,
            image_guidance_scale,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn dummy_image() -> Tensor {
        Tensor::zeros([1, 3, 8, 8], (Kind::Float, tch::Device::Cpu))
    }

    #[test]
    fn rejects_strength_out_of_range() {
        let err = SampleInput::new("p", "", None, Some(1.5), None, 1, 10, 7.5, None, SchedulerKind::Plms)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn rejects_inpaint_mask_without_init_image() {
        let err =
            SampleInput::new("p", "", None, None, Some(dummy_image()), 1, 10, 7.5, None, SchedulerKind::Plms)
                .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn rejects_inpaint_mask_with_strength() {
        let err = SampleInput::new(
            "p",
            "",
            Some(dummy_image()),
            Some(0.5),
            Some(dummy_image()),
            1,
            10,
            7.5,
            None,
            SchedulerKind::Plms,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn rejects_image_guidance_without_init_image() {
        let err =
            SampleInput::new("p", "", None, None, None, 1, 10, 7.5, Some(1.5), SchedulerKind::Plms).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn accepts_well_formed_text_to_image_input() {
        let input = SampleInput::new("p", "", None, None, None, 1, 10, 7.5, None, SchedulerKind::Plms).unwrap();
        assert_eq!(input.step_count, 10);
    }

    #[test]
    fn add_noise_is_identity_when_alpha_t_is_one() {
        let sched = Scheduler::Plms(PlmsScheduler::new(
            1,
            1,
            BetaSchedule::Linear,
            0.0,
            0.0,
            None,
        ));
        let sample = Tensor::from_slice(&[0.25f32]);
        let noise = Tensor::from_slice(&[9.0f32]);
        let out = sched.add_noise(&sample, &noise);
        let value = f64::try_from(out).unwrap();
        assert!((value - 0.25).abs() < 1e-5);
    }
}
