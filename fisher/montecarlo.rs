//! # Monte-Carlo Fisher matrices
//!
//! For a large number of KL eigenmodes the direct evaluation of `Tr(C_a C_b)` for every band
//! pair is dominated by dense products of `n_evals x n_evals` matrices. Here the projected band
//! covariances are never formed. Instead, for every band we draw `nsamples` sky realizations,
//! project them into the eigenmodes of the current `m` and whiten them by `sqrt(1 + lambda)`.
//! The Fisher matrix is then the expected squared overlap between samples of two bands:
//!
//! - off the diagonal, samples of different bands are independent and
//!   `sum |V_a V_b^H|^2 / n^2` is unbiased;
//! - on the diagonal, the `i == j` pairs carry an extra `Tr(C)^2` term which is removed using
//!   the trace of `V_a V_a^H`, followed by the `1 / (1 - 1/n^2)` normalisation.
//!
//! When there are fewer eigenmodes than samples, the same sums are evaluated through the
//! `n_evals x n_evals` Gram matrices `V^H V`, since `Tr((V V^H)^2) = Tr((V^H V)^2)`.

use crate::config::EstimatorConfig;
use crate::simulate::sim_skyvec;
use crate::transfer::TransferArray;
use crate::types::{FisherError, KlProjector, SkyModel, c64, conj_t};
use itertools::Itertools;
use ndarray::{Array2, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

/// Projected sample ensembles for every band at one azimuthal order.
///
/// Each ensemble is `[nsamples, n_evals]`. A cache only ever describes one `m`; it is built by
/// [`MonteCarloFisher::gen_vecs`] and consumed by [`fisher_from_cache`].
#[derive(Debug, Clone)]
pub struct SampleCache {
    order: i32,
    vecs: Vec<Array2<c64>>,
}

impl SampleCache {
    /// Wraps externally drawn ensembles.
    ///
    /// All bands must share the same shape, with at least two samples each: the diagonal bias
    /// correction divides by `1 - 1/n^2`.
    pub fn from_ensembles(order: i32, vecs: Vec<Array2<c64>>) -> Result<Self, FisherError> {
        if let Some(first) = vecs.first() {
            let shape = first.dim();
            if let Some(band) = vecs.iter().position(|v| v.dim() != shape) {
                return Err(FisherError::ShapeMismatch(format!(
                    "ensemble for band {band} has shape {:?}, band 0 has {shape:?}",
                    vecs[band].dim()
                )));
            }
            if shape.0 < 2 {
                return Err(FisherError::InvalidConfig(format!(
                    "sample ensembles need at least 2 samples, got {}",
                    shape.0
                )));
            }
        }
        Ok(Self { order, vecs })
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn nbands(&self) -> usize {
        self.vecs.len()
    }

    pub fn nsamples(&self) -> usize {
        self.vecs.first().map_or(0, |v| v.nrows())
    }

    pub fn nevals(&self) -> usize {
        self.vecs.first().map_or(0, |v| v.ncols())
    }

    /// The `[nsamples, n_evals]` ensemble of one band, if it exists.
    pub fn band(&self, index: usize) -> Option<&Array2<c64>> {
        self.vecs.get(index)
    }
}

/// Monte-Carlo estimator of the per-`m` Fisher matrix.
pub struct MonteCarloFisher<'p, P: KlProjector> {
    projector: &'p P,
    transfers: TransferArray,
    config: EstimatorConfig,
}

impl<'p, P: KlProjector> MonteCarloFisher<'p, P> {
    /// Builds the estimator from transfer matrices generated beforehand.
    pub fn new(
        projector: &'p P,
        transfers: TransferArray,
        config: EstimatorConfig,
    ) -> Result<Self, FisherError> {
        config
            .validate()
            .map_err(|e| FisherError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            projector,
            transfers,
            config,
        })
    }

    /// Generates the band covariances from `sky` and their transfer matrices.
    pub fn from_sky_model<S: SkyModel + ?Sized>(
        projector: &'p P,
        sky: &S,
        config: EstimatorConfig,
    ) -> Result<Self, FisherError> {
        config
            .validate()
            .map_err(|e| FisherError::InvalidConfig(e.to_string()))?;

        let nbands = sky.band_edges().len().saturating_sub(1);
        let clarray = sky.generate_bands()?;
        if clarray.len() != nbands {
            return Err(FisherError::ShapeMismatch(format!(
                "sky model produced {} band covariances for {nbands} bands",
                clarray.len()
            )));
        }

        let transfers = TransferArray::from_bands(&clarray)?;
        Self::new(projector, transfers, config)
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn nbands(&self) -> usize {
        self.transfers.nbands()
    }

    pub fn nsamples(&self) -> usize {
        self.config.nsamples
    }

    pub fn num_evals(&self, order: i32) -> Result<usize, FisherError> {
        self.projector.num_evals(order, self.config.threshold)
    }

    /// The random stream used for `band` at `order`.
    ///
    /// Streams depend only on the configured seed, so a cache can be regenerated exactly and
    /// bands can be drawn on any thread.
    pub fn band_rng(&self, order: i32, band: usize) -> StdRng {
        let key = (u64::from(order as u32) << 32) | (band as u64 & 0xFFFF_FFFF);
        StdRng::seed_from_u64(splitmix64(self.config.seed ^ splitmix64(key)))
    }

    /// Draws `nsamples` projected realizations of `band` at `order`.
    ///
    /// With `scale`, eigenmode `k` is divided by `sqrt(1 + lambda_k)`.
    pub fn get_vecs<R: Rng + ?Sized>(
        &self,
        order: i32,
        band: usize,
        scale: bool,
        rng: &mut R,
    ) -> Result<Array2<c64>, FisherError> {
        self.draw_ensemble(order, band, scale, rng)
            .map_err(|e| e.in_band(order, band))
    }

    fn draw_ensemble<R: Rng + ?Sized>(
        &self,
        order: i32,
        band: usize,
        scale: bool,
        rng: &mut R,
    ) -> Result<Array2<c64>, FisherError> {
        let trans = self
            .transfers
            .band(band)
            .ok_or_else(|| {
                FisherError::ShapeMismatch(format!(
                    "band {band} requested but only {} bands exist",
                    self.nbands()
                ))
            })?
            .view();

        let threshold = self.config.threshold;
        let nevals = self.num_evals(order)?;
        let mut evsims = Array2::<c64>::zeros((self.config.nsamples, nevals));

        for mut row in evsims.outer_iter_mut() {
            let skysim = sim_skyvec(trans, rng);
            let projected =
                self.projector
                    .project_sky_vector_forward(order, skysim.view(), threshold)?;
            if projected.len() != nevals {
                return Err(FisherError::ShapeMismatch(format!(
                    "projection returned {} modes, expected {nevals}",
                    projected.len()
                )));
            }
            row.assign(&projected);
        }

        if scale {
            let evals = self.projector.modes_m(order, threshold)?.evals;
            if evals.len() != nevals {
                return Err(FisherError::ShapeMismatch(format!(
                    "eigensystem has {} eigenvalues, expected {nevals}",
                    evals.len()
                )));
            }
            let weights = evals.mapv(|lambda| c64::new((1.0 + lambda).sqrt().recip(), 0.0));
            evsims *= &weights.insert_axis(Axis(0));
        }

        log::debug!(
            "Drew {} samples of {} modes for band {band} (m={order}).",
            evsims.nrows(),
            evsims.ncols()
        );
        Ok(evsims)
    }

    /// Draws the scaled ensembles for every band at `order`.
    pub fn gen_vecs(&self, order: i32) -> Result<SampleCache, FisherError> {
        let vecs = (0..self.nbands())
            .into_par_iter()
            .map(|band| {
                let mut rng = self.band_rng(order, band);
                self.get_vecs(order, band, true, &mut rng)
            })
            .collect::<Result<Vec<_>, _>>()?;
        SampleCache::from_ensembles(order, vecs)
    }

    /// Estimates the projected covariance of `band` from unscaled samples.
    pub fn makeproj_mc<R: Rng + ?Sized>(
        &self,
        order: i32,
        band: usize,
        rng: &mut R,
    ) -> Result<Array2<c64>, FisherError> {
        let evsims = self.get_vecs(order, band, false, rng)?;
        let norm = c64::new(self.config.nsamples as f64 - 1.0, 0.0);
        Ok(conj_t(&evsims).dot(&evsims) / norm)
    }

    /// The Monte-Carlo Fisher matrix for one azimuthal order.
    pub fn fisher_m_mc(&self, order: i32) -> Result<Array2<c64>, FisherError> {
        let nbands = self.nbands();
        if self.num_evals(order)? == 0 {
            log::info!("No evals (for m={order}), skipping.");
            return Ok(Array2::zeros((nbands, nbands)));
        }

        log::info!("Making fisher (for m={order}).");
        let cache = self.gen_vecs(order)?;
        Ok(fisher_from_cache(&cache))
    }
}

/// Accumulates the bias-corrected Fisher matrix from a sample cache.
pub fn fisher_from_cache(cache: &SampleCache) -> Array2<c64> {
    let nbands = cache.nbands();
    let mut fab = Array2::zeros((nbands, nbands));
    if nbands == 0 {
        return fab;
    }

    let moments = SecondMoments::new(cache);
    let entries: Vec<((usize, usize), c64)> = (0..nbands)
        .cartesian_product(0..nbands)
        .filter(|&(a, b)| b <= a)
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(a, b)| {
            let value = if a == b {
                moments.diagonal(a)
            } else {
                moments.cross(a, b)
            };
            ((a, b), value)
        })
        .collect();

    for ((a, b), value) in entries {
        fab[[a, b]] = value;
        if a != b {
            fab[[b, a]] = value.conj();
        }
    }
    fab
}

enum SecondMoments<'c> {
    /// Gram matrices `V^H V`, used when there are no more eigenmodes than samples.
    ModeSpace { grams: Vec<Array2<c64>>, ns: f64 },
    SampleSpace { vecs: &'c [Array2<c64>], ns: f64 },
}

impl<'c> SecondMoments<'c> {
    fn new(cache: &'c SampleCache) -> Self {
        let ns = cache.nsamples() as f64;
        if cache.nevals() <= cache.nsamples() {
            let grams = cache
                .vecs
                .par_iter()
                .map(|v| conj_t(v).dot(v))
                .collect();
            SecondMoments::ModeSpace { grams, ns }
        } else {
            SecondMoments::SampleSpace {
                vecs: &cache.vecs,
                ns,
            }
        }
    }

    fn ns(&self) -> f64 {
        match self {
            SecondMoments::ModeSpace { ns, .. } | SecondMoments::SampleSpace { ns, .. } => *ns,
        }
    }

    /// `sum |V_a V_b^H|^2`.
    fn overlap_power(&self, a: usize, b: usize) -> f64 {
        match self {
            SecondMoments::ModeSpace { grams, .. } => grams[a]
                .iter()
                .zip(grams[b].iter())
                .map(|(x, y)| (x * y.conj()).re)
                .sum(),
            SecondMoments::SampleSpace { vecs, .. } => vecs[a]
                .dot(&conj_t(&vecs[b]))
                .iter()
                .map(|z| z.norm_sqr())
                .sum(),
        }
    }

    /// `Tr(V_a V_a^H)`.
    fn trace(&self, a: usize) -> f64 {
        match self {
            SecondMoments::ModeSpace { grams, .. } => grams[a].diag().iter().map(|z| z.re).sum(),
            SecondMoments::SampleSpace { vecs, .. } => {
                vecs[a].iter().map(|z| z.norm_sqr()).sum()
            }
        }
    }

    fn cross(&self, a: usize, b: usize) -> c64 {
        let ns = self.ns();
        c64::new(self.overlap_power(a, b) / (ns * ns), 0.0)
    }

    fn diagonal(&self, a: usize) -> c64 {
        let ns = self.ns();
        let trace = self.trace(a);
        let value = (self.overlap_power(a, a) / ns.powi(2) - trace * trace / ns.powi(3))
            / (1.0 - 1.0 / ns.powi(2));
        c64::new(value, 0.0)
    }
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
