//! PLMS/PNDM scheduler: multistep denoising update with history (spec
//! §4.4 "PLMS/PNDM"). History-only variant — no Runge-Kutta warmup.

use std::collections::VecDeque;

use tch::Tensor;

use super::beta_schedule::{self, BetaSchedule};

/// `{trainStepCount, inferenceStepCount, betas, alphas, alphasCumProd,
/// timeSteps, counter, ets, currentSample}` (spec §3 "SchedulerState
/// (PLMS)"). One instance per image in a batch; single-writer.
pub struct PlmsScheduler {
    train_timesteps: usize,
    alphas_cumprod: Vec<f64>,
    time_steps: Vec<i64>,
    step_delta: i64,
    counter: usize,
    ets: VecDeque<Tensor>,
    current_sample: Option<Tensor>,
}

impl PlmsScheduler {
    pub fn new(
        step_count: usize,
        train_timesteps: usize,
        beta_schedule: BetaSchedule,
        beta_start: f64,
        beta_end: f64,
        strength: Option<f64>,
    ) -> Self {
        let betas = beta_schedule::betas(beta_schedule, beta_start, beta_end, train_timesteps);
        let alphas = beta_schedule::alphas(&betas);
        let alphas_cumprod = beta_schedule::alphas_cumprod(&alphas);

        let forward = beta_schedule::forward_timesteps(train_timesteps, step_count);
        let mut decreasing: Vec<i64> = forward.into_iter().rev().collect();
        decreasing = beta_schedule::truncate_for_strength(&decreasing, strength);

        // Bootstrap replay: duplicate the first (latest) timestep and drop
        // the last (earliest) one, keeping the array length unchanged
        // (spec §3 invariant: exactly one duplicate, strictly decreasing
        // otherwise; spec §8 property 2).
        let time_steps = if decreasing.len() >= 2 {
            let mut ts = Vec::with_capacity(decreasing.len());
            ts.push(decreasing[0]);
            ts.extend_from_slice(&decreasing[..decreasing.len() - 1]);
            ts
        } else {
            decreasing
        };

        let step_delta = (train_timesteps / step_count) as i64;

        PlmsScheduler {
            train_timesteps,
            alphas_cumprod,
            time_steps,
            step_delta,
            counter: 0,
            ets: VecDeque::with_capacity(4),
            current_sample: None,
        }
    }

    pub fn time_steps(&self) -> &[i64] {
        &self.time_steps
    }

    fn alpha_cumprod_at(&self, t: i64) -> f64 {
        let idx = t.max(0) as usize;
        self.alphas_cumprod[idx.min(self.alphas_cumprod.len() - 1)]
    }

    /// Spec §4.4 previous-sample update:
    /// `coeffSample = sqrt(alpha_tp/alpha_t)`,
    /// `denom = alpha_t*sqrt(1-alpha_tp) + sqrt(alpha_t*(1-alpha_t)*alpha_tp)`,
    /// `coeffModel = -(alpha_tp - alpha_t)/denom`,
    /// `prev = coeffSample*sample + coeffModel*modelOutput`.
    fn get_prev_sample(&self, sample: &Tensor, t: i64, prev_t: i64, model_output: &Tensor) -> Tensor {
        let alpha_t = self.alpha_cumprod_at(t);
        let alpha_tp = self.alpha_cumprod_at(prev_t.max(0));

        let coeff_sample = (alpha_tp / alpha_t).sqrt();
        let denom = alpha_t * (1.0 - alpha_tp).sqrt() + (alpha_t * (1.0 - alpha_t) * alpha_tp).sqrt();
        let coeff_model = -(alpha_tp - alpha_t) / denom;

        sample * coeff_sample + model_output * coeff_model
    }

    /// Consume one predicted noise tensor and advance the scheduler state
    /// by exactly one `counter` tick (spec §5 ordering guarantee).
    pub fn step(&mut self, model_output: &Tensor, t: i64, sample: &Tensor) -> Tensor {
        let mut prev_timestep = t - self.step_delta;
        let mut timestep = t;

        if self.counter != 1 {
            while self.ets.len() > 3 {
                self.ets.pop_front();
            }
            self.ets.push_back(model_output.shallow_clone());
        } else {
            prev_timestep = timestep;
            timestep += self.step_delta;
        }

        let effective_output = if self.ets.len() == 1 && self.counter == 0 {
            self.current_sample = Some(sample.shallow_clone());
            model_output.shallow_clone()
        } else if self.ets.len() == 1 && self.counter == 1 {
            let restored = self.current_sample.take().expect("bootstrap snapshot missing");
            let out = (model_output + &self.ets[self.ets.len() - 1]) / 2.0;
            return self.finish_step(&out, timestep, prev_timestep, &restored);
        } else if self.ets.len() == 2 {
            weighted_two(&self.ets)
        } else if self.ets.len() == 3 {
            weighted_three(&self.ets)
        } else {
            weighted_four(&self.ets)
        };

        self.finish_step(&effective_output, timestep, prev_timestep, sample)
    }

    fn finish_step(&mut self, model_output: &Tensor, timestep: i64, prev_timestep: i64, sample: &Tensor) -> Tensor {
        let prev_sample = self.get_prev_sample(sample, timestep, prev_timestep, model_output);
        self.counter += 1;
        prev_sample
    }

    pub fn train_timesteps(&self) -> usize {
        self.train_timesteps
    }

    /// `alphasCumProd` at the first (latest/noisiest) scheduled timestep,
    /// for `addNoise` (spec §4.4 "Common helpers", §8 property 4).
    pub fn initial_alpha_cumprod(&self) -> f64 {
        self.alpha_cumprod_at(self.time_steps[0])
    }
}

fn weighted_two(ets: &VecDeque<Tensor>) -> Tensor {
    let n = ets.len();
    &ets[n - 1] * 1.5 - &ets[n - 2] * 0.5
}

fn weighted_three(ets: &VecDeque<Tensor>) -> Tensor {
    let n = ets.len();
    (&ets[n - 1] * 23.0 - &ets[n - 2] * 16.0 + &ets[n - 3] * 5.0) / 12.0
}

fn weighted_four(ets: &VecDeque<Tensor>) -> Tensor {
    let n = ets.len();
    (&ets[n - 1] * 55.0 - &ets[n - 2] * 59.0 + &ets[n - 3] * 37.0 - &ets[n - 4] * 9.0) / 24.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn scalar(v: f64) -> Tensor {
        Tensor::from_slice(&[v as f32]).to_kind(Kind::Float)
    }

    #[test]
    fn timestep_count_matches_step_count_without_strength() {
        let sched = PlmsScheduler::new(50, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, None);
        assert_eq!(sched.time_steps().len(), 50);
    }

    #[test]
    fn timestep_count_matches_floor_n_times_strength() {
        let sched = PlmsScheduler::new(50, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, Some(0.5));
        assert_eq!(sched.time_steps().len(), 25);
    }

    #[test]
    fn first_two_timesteps_are_a_duplicate_then_strictly_decreasing() {
        let sched = PlmsScheduler::new(10, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, None);
        let ts = sched.time_steps();
        assert_eq!(ts[0], ts[1]);
        for w in ts[1..].windows(2) {
            assert!(w[0] > w[1], "timesteps must strictly decrease after the bootstrap duplicate");
        }
    }

    #[test]
    fn step_runs_across_full_schedule_without_panicking() {
        let mut sched = PlmsScheduler::new(8, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, None);
        let mut sample = scalar(0.5);
        let ts: Vec<i64> = sched.time_steps().to_vec();
        for &t in &ts {
            let noise = scalar(0.1);
            sample = sched.step(&noise, t, &sample);
        }
        let value = f64::try_from(sample).unwrap();
        assert!(value.is_finite());
    }

    #[test]
    fn ets_never_exceeds_four_entries() {
        let mut sched = PlmsScheduler::new(12, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, None);
        let mut sample = scalar(0.5);
        let ts: Vec<i64> = sched.time_steps().to_vec();
        for &t in &ts {
            sample = sched.step(&scalar(0.05), t, &sample);
            assert!(sched.ets.len() <= 4);
        }
    }
}
