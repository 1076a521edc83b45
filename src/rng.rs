//! Deterministic normal-distribution sampler seeded by a 32-bit seed.
//!
//! Reproduces NumPy's legacy `RandomState` bit-for-bit: a from-scratch
//! MT19937 (Mersenne Twister) core, NumPy's 53-bit uniform-double
//! construction, and NumPy's cached polar Box-Muller (Marsaglia) normal
//! variate. This is deliberately *not* the reference training framework's
//! RNG (out of scope, see crate-level docs) — it is the one documented
//! substitute this crate commits to reproducing exactly.

use tch::{Kind, Tensor};

const N: usize = 624;
const M: usize = 397;
const MATRIX_A: u32 = 0x9908_b0df;
const UPPER_MASK: u32 = 0x8000_0000;
const LOWER_MASK: u32 = 0x7fff_ffff;

/// A from-scratch MT19937 generator plus the cached-pair normal sampler
/// NumPy's legacy `RandomState` uses.
///
/// Owns the full mutable state a sampling run needs: the Mersenne Twister
/// word array/cursor, and the one cached Gaussian half-pair. Each
/// [`Pipeline`](crate::pipeline::Pipeline) run constructs one `SeededRng`
/// per image from the request's 32-bit seed offset by the image index, so a
/// multi-image batch remains reproducible per index.
pub struct SeededRng {
    state: [u32; N],
    index: usize,
    cached_gauss: Option<f64>,
}

impl SeededRng {
    /// Seed the generator the way NumPy's legacy `RandomState(seed)` seeds
    /// its MT19937 core for a scalar integer seed: `init_genrand`.
    pub fn new(seed: u32) -> Self {
        let mut state = [0u32; N];
        state[0] = seed;
        for i in 1..N {
            state[i] = 1_812_433_253u32
                .wrapping_mul(state[i - 1] ^ (state[i - 1] >> 30))
                .wrapping_add(i as u32);
        }
        SeededRng { state, index: N, cached_gauss: None }
    }

    fn next_u32(&mut self) -> u32 {
        if self.index >= N {
            self.twist();
        }
        let mut y = self.state[self.index];
        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^= y >> 18;
        self.index += 1;
        y
    }

    fn twist(&mut self) {
        for i in 0..N {
            let x = (self.state[i] & UPPER_MASK) | (self.state[(i + 1) % N] & LOWER_MASK);
            let mut x_a = x >> 1;
            if x & 1 != 0 {
                x_a ^= MATRIX_A;
            }
            self.state[i] = self.state[(i + M) % N] ^ x_a;
        }
        self.index = 0;
    }

    /// NumPy legacy `random_sample`: two 32-bit draws combined into a
    /// 53-bit double uniform on `[0, 1)`.
    fn next_f64(&mut self) -> f64 {
        let a = self.next_u32() >> 5;
        let b = self.next_u32() >> 6;
        (a as f64 * 67_108_864.0 + b as f64) / 9_007_199_254_740_992.0
    }

    /// NumPy legacy `legacy_gauss`: cached-pair polar (Marsaglia) Box-Muller.
    /// Returns one standard normal variate per call, consuming two uniform
    /// draws every *other* call.
    fn next_standard_normal(&mut self) -> f64 {
        if let Some(g) = self.cached_gauss.take() {
            return g;
        }
        loop {
            let x1 = 2.0 * self.next_f64() - 1.0;
            let x2 = 2.0 * self.next_f64() - 1.0;
            let r2 = x1 * x1 + x2 * x2;
            if r2 < 1.0 && r2 != 0.0 {
                let f = (-2.0 * r2.ln() / r2).sqrt();
                self.cached_gauss = Some(f * x1);
                return f * x2;
            }
        }
    }

    /// Fill `count` standard-normal f64 values in row-major consumption
    /// order, matching how NumPy fills an ndarray element by element.
    pub fn standard_normal_vec(&mut self, count: usize) -> Vec<f64> {
        (0..count).map(|_| self.next_standard_normal()).collect()
    }

    /// Sample a `[shape]` tensor of `N(0, sigma^2)`, in float32.
    pub fn normal_tensor(&mut self, shape: &[i64], sigma: f64) -> Tensor {
        let count: i64 = shape.iter().product();
        let values: Vec<f32> = self
            .standard_normal_vec(count as usize)
            .into_iter()
            .map(|z| (z * sigma) as f32)
            .collect();
        Tensor::from_slice(&values).view(shape).to_kind(Kind::Float)
    }

    /// Reparameterization-trick sample: `mean + z * std`, elementwise, for
    /// the VAE encoder's diagonal Gaussian (spec §4.3 step 5). `mean`/`std`
    /// are tensors of identical shape; the normal draws are generated in
    /// the tensor's row-major element order and reshaped to match.
    pub fn normal_like(&mut self, mean: &Tensor, std: &Tensor) -> Tensor {
        let shape = mean.size();
        let count: i64 = shape.iter().product();
        let z: Vec<f32> = self
            .standard_normal_vec(count as usize)
            .into_iter()
            .map(|v| v as f32)
            .collect();
        let z = Tensor::from_slice(&z).view(shape.as_slice()).to_kind(Kind::Float);
        mean + std * z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_mt19937_stream_for_seed_zero() {
        // First three `genrand_int32()` outputs for seed 0, a widely
        // published MT19937 reference vector (e.g. the original
        // mt19937ar.c test harness distributed by Matsumoto & Nishimura).
        let mut rng = SeededRng::new(0);
        assert_eq!(rng.next_u32(), 2_357_136_044);
        assert_eq!(rng.next_u32(), 2_546_248_239);
        assert_eq!(rng.next_u32(), 3_071_714_933);
    }

    #[test]
    fn uniform_draws_stay_in_unit_interval() {
        let mut rng = SeededRng::new(42);
        for _ in 0..1000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn normal_sampler_caches_every_other_draw() {
        let mut rng = SeededRng::new(7);
        assert!(rng.cached_gauss.is_none());
        let _first = rng.next_standard_normal();
        assert!(rng.cached_gauss.is_some());
        let _second = rng.next_standard_normal();
        assert!(rng.cached_gauss.is_none());
    }

    #[test]
    fn same_seed_is_deterministic() {
        let mut a = SeededRng::new(93);
        let mut b = SeededRng::new(93);
        assert_eq!(a.standard_normal_vec(16), b.standard_normal_vec(16));
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = SeededRng::new(1);
        let mut b = SeededRng::new(2);
        assert_ne!(a.standard_normal_vec(8), b.standard_normal_vec(8));
    }

    #[test]
    fn normal_tensor_has_requested_shape() {
        let mut rng = SeededRng::new(5);
        let t = rng.normal_tensor(&[1, 4, 8, 8], 1.0);
        assert_eq!(t.size(), vec![1, 4, 8, 8]);
        assert_eq!(t.kind(), Kind::Float);
    }
}
