//! Beta schedule construction shared by both schedulers (spec §4.4).

/// Which curve the per-timestep noise variance `beta` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    /// `linspace(start, end, T)`.
    Linear,
    /// `linspace(sqrt(start), sqrt(end), T)^2`.
    ScaledLinear,
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps == 1 {
        return vec![start];
    }
    let step = (end - start) / (steps - 1) as f64;
    (0..steps).map(|i| start + step * i as f64).collect()
}

/// Build `betas[T]` for the given schedule.
pub fn betas(schedule: BetaSchedule, beta_start: f64, beta_end: f64, train_timesteps: usize) -> Vec<f64> {
    match schedule {
        BetaSchedule::Linear => linspace(beta_start, beta_end, train_timesteps),
        BetaSchedule::ScaledLinear => linspace(beta_start.sqrt(), beta_end.sqrt(), train_timesteps)
            .into_iter()
            .map(|b| b * b)
            .collect(),
    }
}

/// `alphas[i] = 1 - betas[i]`.
pub fn alphas(betas: &[f64]) -> Vec<f64> {
    betas.iter().map(|b| 1.0 - b).collect()
}

/// Running product `alphasCumProd[i] = prod_{j<=i} alphas[j]`.
pub fn alphas_cumprod(alphas: &[f64]) -> Vec<f64> {
    let mut acc = 1.0;
    alphas
        .iter()
        .map(|a| {
            acc *= a;
            acc
        })
        .collect()
}

/// Forward timestep selection (spec §4.4 "Step selection"):
/// `{round(i*T/N)+1 : i in [0, N)}`, returned in the increasing (training)
/// order produced by the formula; callers reverse for the decreasing
/// inference-time order.
pub fn forward_timesteps(train_timesteps: usize, inference_steps: usize) -> Vec<i64> {
    let ratio = train_timesteps as f64 / inference_steps as f64;
    (0..inference_steps)
        .map(|i| ((i as f64 * ratio).round() as i64) + 1)
        .collect()
}

/// Truncate a (decreasing) timestep list to the last `floor(N*s)` entries,
/// for image-to-image `strength` (spec §4.4). `timesteps` must already be
/// in decreasing inference order. Returns the full list unchanged when
/// `strength` is `None`.
pub fn truncate_for_strength(timesteps: &[i64], strength: Option<f64>) -> Vec<i64> {
    match strength {
        None => timesteps.to_vec(),
        Some(s) => {
            let keep = ((timesteps.len() as f64) * s).floor() as usize;
            let keep = keep.min(timesteps.len());
            timesteps[timesteps.len() - keep..].to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphas_cumprod_matches_running_product() {
        let b = betas(BetaSchedule::Linear, 0.00085, 0.012, 1000);
        let a = alphas(&b);
        let acp = alphas_cumprod(&a);
        let mut expected = 1.0;
        for (i, &alpha) in a.iter().enumerate() {
            expected *= alpha;
            assert!((acp[i] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn forward_timesteps_has_requested_length() {
        let ts = forward_timesteps(1000, 50);
        assert_eq!(ts.len(), 50);
    }

    #[test]
    fn truncate_for_strength_keeps_floor_n_times_s() {
        let ts: Vec<i64> = (0..50).rev().collect();
        let truncated = truncate_for_strength(&ts, Some(0.5));
        assert_eq!(truncated.len(), 25);
        // the *last* (latest-denoising) steps are kept
        assert_eq!(truncated, ts[25..]);
    }

    #[test]
    fn truncate_for_strength_none_is_identity() {
        let ts: Vec<i64> = (0..50).rev().collect();
        assert_eq!(truncate_for_strength(&ts, None), ts);
    }
}
