//! An in-memory telescope standing in for the beam-transfer and KL machinery.
//!
//! Band `a` carries power on the multipoles `band_edges[a] <= l < band_edges[a + 1]` with a
//! Gaussian coherence between frequency channels. Every azimuthal order gets a fixed random
//! KL basis over the `(nu, l >= |m|)` sky coefficients, with eigenvalues falling off as
//! `eigenvalue_scale / (1 + k)^2`. The result is not a physical telescope, but it has the same
//! shapes and linear structure as one.

use crate::types::{FisherError, KlModes, KlProjector, SkyModel, c64};
use ndarray::{Array1, Array2, Array3, ArrayView2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticTelescopeConfig {
    pub nfreq: usize,
    pub lmax: usize,
    pub mmax: usize,
    /// Upper bound on the number of KL modes per order before thresholding.
    pub modes_per_order: usize,
    /// Band edges in `l`.
    pub band_edges: Vec<f64>,
    pub amplitude: f64,
    /// Coherence length across frequency channels, in channels.
    pub freq_correlation: f64,
    pub eigenvalue_scale: f64,
    pub seed: u64,
}

impl Default for SyntheticTelescopeConfig {
    fn default() -> Self {
        Self {
            nfreq: 8,
            lmax: 16,
            mmax: 16,
            modes_per_order: 24,
            band_edges: vec![0.0, 4.0, 8.0, 17.0],
            amplitude: 1.0,
            freq_correlation: 2.0,
            eigenvalue_scale: 50.0,
            seed: 2012,
        }
    }
}

impl SyntheticTelescopeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nfreq == 0 {
            return Err(ConfigError::Invalid("nfreq must be positive".to_string()));
        }
        if self.mmax > self.lmax {
            return Err(ConfigError::Invalid(format!(
                "mmax ({}) cannot exceed lmax ({})",
                self.mmax, self.lmax
            )));
        }
        if self.band_edges.len() < 2 {
            return Err(ConfigError::Invalid(
                "at least two band edges are required".to_string(),
            ));
        }
        if self
            .band_edges
            .windows(2)
            .any(|pair| !pair[0].is_finite() || !pair[1].is_finite() || pair[1] <= pair[0])
        {
            return Err(ConfigError::Invalid(
                "band edges must be finite and strictly increasing".to_string(),
            ));
        }
        if !(self.amplitude.is_finite() && self.amplitude >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "amplitude must be finite and non-negative, got {}",
                self.amplitude
            )));
        }
        if !(self.freq_correlation.is_finite() && self.freq_correlation > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "freq_correlation must be positive, got {}",
                self.freq_correlation
            )));
        }
        if !(self.eigenvalue_scale.is_finite() && self.eigenvalue_scale >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "eigenvalue_scale must be finite and non-negative, got {}",
                self.eigenvalue_scale
            )));
        }
        Ok(())
    }
}

struct OrderBasis {
    evals: Array1<f64>,
    evecs: Array2<c64>,
}

pub struct SyntheticTelescope {
    config: SyntheticTelescopeConfig,
    bases: Vec<OrderBasis>,
}

impl SyntheticTelescope {
    pub fn new(config: SyntheticTelescopeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mmax = config.mmax as i32;
        let bases = (-mmax..=mmax)
            .map(|order| Self::order_basis(&config, order))
            .collect();
        Ok(Self { config, bases })
    }

    fn order_basis(config: &SyntheticTelescopeConfig, order: i32) -> OrderBasis {
        let width = config.nfreq * (config.lmax + 1 - order.unsigned_abs() as usize);
        let nmodes = config.modes_per_order.min(width);
        let mut rng = StdRng::seed_from_u64(config.seed ^ u64::from(order as u32).rotate_left(17));

        let mut evecs = Array2::from_shape_fn((nmodes, width), |_| {
            let re: f64 = rng.sample(StandardNormal);
            let im: f64 = rng.sample(StandardNormal);
            c64::new(re, im)
        });
        for mut row in evecs.outer_iter_mut() {
            let norm = row.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt();
            if norm > 0.0 {
                row.mapv_inplace(|z| z / norm);
            }
        }

        let evals = Array1::from_shape_fn(nmodes, |k| {
            config.eigenvalue_scale / ((1 + k) as f64).powi(2)
        });
        OrderBasis { evals, evecs }
    }

    pub fn config(&self) -> &SyntheticTelescopeConfig {
        &self.config
    }

    /// All azimuthal orders the telescope resolves, `-mmax..=mmax`.
    pub fn orders(&self) -> Vec<i32> {
        let mmax = self.config.mmax as i32;
        (-mmax..=mmax).collect()
    }

    fn basis(&self, order: i32) -> Option<&OrderBasis> {
        let mmax = self.config.mmax as i32;
        if order.abs() > mmax {
            return None;
        }
        self.bases.get((order + mmax) as usize)
    }

    /// Number of leading modes with `lambda >= threshold`; eigenvalues are sorted descending.
    fn kept_modes(basis: &OrderBasis, threshold: f64) -> usize {
        basis.evals.iter().take_while(|&&v| v >= threshold).count()
    }
}

impl SkyModel for SyntheticTelescope {
    fn band_edges(&self) -> &[f64] {
        &self.config.band_edges
    }

    fn generate_bands(&self) -> Result<Vec<Array3<c64>>, FisherError> {
        let nfreq = self.config.nfreq;
        let nell = self.config.lmax + 1;
        let corr = self.config.freq_correlation;

        let coherence = Array2::from_shape_fn((nfreq, nfreq), |(i, j)| {
            let d = (i as f64 - j as f64) / corr;
            c64::new(self.config.amplitude * (-0.5 * d * d).exp(), 0.0)
        });

        let bands = self
            .config
            .band_edges
            .windows(2)
            .map(|edges| {
                let mut clzz = Array3::zeros((nell, nfreq, nfreq));
                for ell in 0..nell {
                    let l = ell as f64;
                    if l >= edges[0] && l < edges[1] {
                        clzz.slice_mut(s![ell, .., ..]).assign(&coherence);
                    }
                }
                clzz
            })
            .collect();
        Ok(bands)
    }
}

impl KlProjector for SyntheticTelescope {
    fn modes_m(&self, order: i32, threshold: f64) -> Result<KlModes, FisherError> {
        let Some(basis) = self.basis(order) else {
            return Ok(KlModes::empty(0));
        };
        let n = Self::kept_modes(basis, threshold);
        Ok(KlModes {
            evals: basis.evals.slice(s![..n]).to_owned(),
            evecs: basis.evecs.slice(s![..n, ..]).to_owned(),
        })
    }

    fn num_evals(&self, order: i32, threshold: f64) -> Result<usize, FisherError> {
        Ok(self
            .basis(order)
            .map_or(0, |basis| Self::kept_modes(basis, threshold)))
    }

    fn project_sky_vector_forward(
        &self,
        order: i32,
        sky: ArrayView2<'_, c64>,
        threshold: f64,
    ) -> Result<Array1<c64>, FisherError> {
        let expected = (self.config.nfreq, self.config.lmax + 1);
        if sky.dim() != expected {
            return Err(FisherError::ShapeMismatch(format!(
                "sky vector has shape {:?}, expected {expected:?}",
                sky.dim()
            )));
        }
        let Some(basis) = self.basis(order) else {
            return Ok(Array1::zeros(0));
        };

        let lmin = order.unsigned_abs() as usize;
        let visible = sky.slice(s![.., lmin..]);
        let flat = Array1::from_iter(visible.iter().copied());
        let n = Self::kept_modes(basis, threshold);
        Ok(basis.evecs.slice(s![..n, ..]).dot(&flat))
    }
}
