//! Second-order multistep DPM-Solver++ scheduler (spec §4.4 "DPM-Solver++
//! (2M)"). Precomputes `sigmas[i] = sqrt((1-alpha_tp)/alpha_tp)`; converts
//! each model output to a data (`x0`) prediction; the first call uses a
//! first-order update (equivalent to DDIM in data-prediction form), every
//! later call extrapolates with the previous step's data prediction using
//! log-sigma ("log-SNR") step sizes.

use tch::Tensor;

use super::beta_schedule::{self, BetaSchedule};

/// `{…, previousModelOutput, sigmas, lowerOrderNums}` (spec §3
/// "SchedulerState (DPMpp)").
pub struct DpmSolverMultistepScheduler {
    alphas_cumprod: Vec<f64>,
    time_steps: Vec<i64>,
    sigmas: Vec<f64>,
    step_delta: i64,
    counter: usize,
    lower_order_nums: usize,
    previous_data_prediction: Option<Tensor>,
    previous_log_sigma: Option<f64>,
}

impl DpmSolverMultistepScheduler {
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
        let decreasing: Vec<i64> = forward.into_iter().rev().collect();
        let time_steps = beta_schedule::truncate_for_strength(&decreasing, strength);

        let sigma_at = |t: i64| -> f64 {
            let idx = (t.max(0) as usize).min(alphas_cumprod.len() - 1);
            let alpha_bar = alphas_cumprod[idx];
            ((1.0 - alpha_bar) / alpha_bar).sqrt()
        };
        let mut sigmas: Vec<f64> = time_steps.iter().map(|&t| sigma_at(t)).collect();
        sigmas.push(sigma_at(0));

        let step_delta = (train_timesteps / step_count) as i64;

        DpmSolverMultistepScheduler {
            alphas_cumprod,
            time_steps,
            sigmas,
            step_delta,
            counter: 0,
            lower_order_nums: 0,
            previous_data_prediction: None,
            previous_log_sigma: None,
        }
    }

    pub fn time_steps(&self) -> &[i64] {
        &self.time_steps
    }

    /// `alphasCumProd` at the first (latest/noisiest) scheduled timestep,
    /// for `addNoise` (spec §4.4 "Common helpers", §8 property 4).
    pub fn initial_alpha_cumprod(&self) -> f64 {
        self.alpha_cumprod_at(self.time_steps[0])
    }

    fn alpha_cumprod_at(&self, t: i64) -> f64 {
        let idx = t.max(0) as usize;
        self.alphas_cumprod[idx.min(self.alphas_cumprod.len() - 1)]
    }

    fn sigma_at(&self, t: i64) -> f64 {
        let alpha_bar = self.alpha_cumprod_at(t.max(0));
        ((1.0 - alpha_bar) / alpha_bar).sqrt()
    }

    /// log-SNR-like quantity, monotonically decreasing as `sigma` grows
    /// (i.e. as the timestep becomes noisier).
    fn log_sigma(&self, t: i64) -> f64 {
        -self.sigma_at(t).ln()
    }

    /// Spec §4.4 data-prediction branch: `(sample - sigma_t*output) / sqrt(1+sigma_t^2)`.
    fn data_prediction(&self, sample: &Tensor, model_output: &Tensor, t: i64) -> Tensor {
        let sigma_t = self.sigma_at(t);
        (sample - model_output * sigma_t) / (1.0 + sigma_t * sigma_t).sqrt()
    }

    /// First-order DPM-Solver++ update, equivalent to DDIM expressed in
    /// terms of a data (`x0`) prediction.
    fn first_order_update(&self, data_pred: &Tensor, model_output: &Tensor, prev_t: i64) -> Tensor {
        let alpha_bar_prev = self.alpha_cumprod_at(prev_t.max(0));
        data_pred * alpha_bar_prev.sqrt() + model_output * (1.0 - alpha_bar_prev).sqrt()
    }

    /// Second-order (2M) multistep update using the current and previous
    /// data predictions, weighted by the ratio of consecutive log-sigma
    /// step sizes.
    fn second_order_update(
        &self,
        data_pred: &Tensor,
        prev_data_pred: &Tensor,
        model_output: &Tensor,
        t: i64,
        prev_t: i64,
        prev_log_sigma: f64,
    ) -> Tensor {
        let lambda_t = self.log_sigma(t);
        let lambda_prev = self.log_sigma(prev_t);
        let h = lambda_prev - lambda_t;
        let h_last = lambda_t - prev_log_sigma;
        let r0 = if h.abs() > 1e-12 { h_last / h } else { 0.0 };

        let d1 = (data_pred - prev_data_pred) * (0.5 * r0);
        let blended = data_pred + &d1;

        let alpha_bar_prev = self.alpha_cumprod_at(prev_t.max(0));
        blended * alpha_bar_prev.sqrt() + model_output * (1.0 - alpha_bar_prev).sqrt()
    }

    /// Consume one predicted noise tensor and advance the scheduler state
    /// by exactly one `counter` tick.
    pub fn step(&mut self, model_output: &Tensor, t: i64, sample: &Tensor) -> Tensor {
        let prev_t = t - self.step_delta;
        let data_pred = self.data_prediction(sample, model_output, t);

        let prev_sample = if self.lower_order_nums < 1 {
            self.first_order_update(&data_pred, model_output, prev_t)
        } else {
            let prev_data_pred = self
                .previous_data_prediction
                .as_ref()
                .expect("second-order update requires a previous data prediction");
            let prev_log_sigma = self.previous_log_sigma.expect("previous log-sigma missing");
            self.second_order_update(&data_pred, prev_data_pred, model_output, t, prev_t, prev_log_sigma)
        };

        self.previous_log_sigma = Some(self.log_sigma(t));
        self.previous_data_prediction = Some(data_pred);
        self.lower_order_nums = (self.lower_order_nums + 1).min(2);
        self.counter += 1;
        prev_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn scalar(v: f64) -> Tensor {
        Tensor::from_slice(&[v as f32]).to_kind(Kind::Float)
    }

    #[test]
    fn timestep_count_matches_step_count() {
        let sched = DpmSolverMultistepScheduler::new(30, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, None);
        assert_eq!(sched.time_steps().len(), 30);
    }

    #[test]
    fn timestep_count_respects_strength() {
        let sched = DpmSolverMultistepScheduler::new(30, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, Some(0.4));
        assert_eq!(sched.time_steps().len(), 12);
    }

    #[test]
    fn lower_order_nums_saturates_at_two() {
        let mut sched = DpmSolverMultistepScheduler::new(10, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, None);
        let mut sample = scalar(0.5);
        let ts: Vec<i64> = sched.time_steps().to_vec();
        for &t in &ts {
            sample = sched.step(&scalar(0.1), t, &sample);
        }
        assert_eq!(sched.lower_order_nums, 2);
    }

    #[test]
    fn step_runs_across_full_schedule_without_panicking() {
        let mut sched = DpmSolverMultistepScheduler::new(20, 1000, BetaSchedule::ScaledLinear, 0.00085, 0.012, None);
        let mut sample = scalar(0.5);
        let ts: Vec<i64> = sched.time_steps().to_vec();
        for &t in &ts {
            sample = sched.step(&scalar(0.05), t, &sample);
        }
        let value = f64::try_from(sample).unwrap();
        assert!(value.is_finite());
    }
}
