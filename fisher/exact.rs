//! Direct evaluation of the Fisher matrix by traces of projected band covariances.
//!
//! The projection into KL modes is only available as an opaque linear map, so its matrix is
//! recovered column by column from unit sky vectors. This costs one projection per
//! `(nu, l)` pair and is meant for orders with few eigenmodes, which is exactly where the
//! switch policy sends work here.

use crate::types::{ExactFisher, FisherError, KlProjector, SkyModel, c64, conj_t};
use ndarray::{Array2, Array3, Axis, s};
use rayon::prelude::*;

pub struct DirectTraceFisher<'p, P: KlProjector> {
    projector: &'p P,
    clarray: Vec<Array3<c64>>,
    threshold: f64,
}

impl<'p, P: KlProjector> DirectTraceFisher<'p, P> {
    pub fn new(
        projector: &'p P,
        clarray: Vec<Array3<c64>>,
        threshold: f64,
    ) -> Result<Self, FisherError> {
        if let Some(first) = clarray.first() {
            let shape = first.dim();
            if shape.1 != shape.2 {
                return Err(FisherError::ShapeMismatch(format!(
                    "covariance tensor has frequency axes {} and {}",
                    shape.1, shape.2
                )));
            }
            if clarray.iter().any(|clzz| clzz.dim() != shape) {
                return Err(FisherError::ShapeMismatch(
                    "band covariances do not share one shape".to_string(),
                ));
            }
        }
        Ok(Self {
            projector,
            clarray,
            threshold,
        })
    }

    pub fn from_sky_model<S: SkyModel + ?Sized>(
        projector: &'p P,
        sky: &S,
        threshold: f64,
    ) -> Result<Self, FisherError> {
        Self::new(projector, sky.generate_bands()?, threshold)
    }

    pub fn nbands(&self) -> usize {
        self.clarray.len()
    }

    fn sky_shape(&self) -> (usize, usize) {
        self.clarray
            .first()
            .map_or((0, 0), |clzz| (clzz.dim().1, clzz.dim().0))
    }

    /// Matrix of the forward projection, `[n_evals, n_freq * n_ell]`, with column index
    /// `nu * n_ell + l`.
    pub fn projection_matrix(&self, order: i32) -> Result<Array2<c64>, FisherError> {
        let (nfreq, nell) = self.sky_shape();
        let nevals = self.projector.num_evals(order, self.threshold)?;
        let mut proj = Array2::zeros((nevals, nfreq * nell));
        let mut unit = Array2::<c64>::zeros((nfreq, nell));

        for f in 0..nfreq {
            for ell in 0..nell {
                unit[[f, ell]] = c64::new(1.0, 0.0);
                let column =
                    self.projector
                        .project_sky_vector_forward(order, unit.view(), self.threshold)?;
                unit[[f, ell]] = c64::new(0.0, 0.0);
                if column.len() != nevals {
                    return Err(FisherError::ShapeMismatch(format!(
                        "projection returned {} modes, expected {nevals}",
                        column.len()
                    )));
                }
                proj.column_mut(f * nell + ell).assign(&column);
            }
        }
        Ok(proj)
    }

    fn project_band(&self, proj: &Array2<c64>, band: usize) -> Array2<c64> {
        let clzz = &self.clarray[band];
        let nell = clzz.dim().0;
        let nevals = proj.nrows();
        let mut cov = Array2::<c64>::zeros((nevals, nevals));
        for ell in 0..nell {
            let block = clzz.slice(s![ell, .., ..]);
            if block.iter().all(|z| z.norm_sqr() == 0.0) {
                continue;
            }
            let proj_l = proj.slice(s![.., ell..;nell as isize]).to_owned();
            cov += &proj_l.dot(&block).dot(&conj_t(&proj_l));
        }
        cov
    }

    /// The projected covariance `P C_a P^H` of one band in the eigenmodes of `order`.
    pub fn makeproj(&self, order: i32, band: usize) -> Result<Array2<c64>, FisherError> {
        if band >= self.nbands() {
            return Err(FisherError::ShapeMismatch(format!(
                "band {band} requested but only {} bands exist",
                self.nbands()
            ))
            .in_band(order, band));
        }
        let proj = self.projection_matrix(order)?;
        Ok(self.project_band(&proj, band))
    }
}

impl<P: KlProjector> ExactFisher for DirectTraceFisher<'_, P> {
    fn fisher_m(&self, order: i32) -> Result<Array2<c64>, FisherError> {
        let nbands = self.nbands();
        let mut fab = Array2::zeros((nbands, nbands));

        let modes = self.projector.modes_m(order, self.threshold)?;
        if modes.is_empty() {
            log::info!("No evals (for m={order}), skipping.");
            return Ok(fab);
        }
        log::info!("Making fisher (for m={order}) by direct trace evaluation.");

        let proj = self.projection_matrix(order)?;
        let weights = modes.evals.mapv(|lambda| (1.0 + lambda).sqrt().recip());
        let whitening = weights
            .view()
            .insert_axis(Axis(1))
            .dot(&weights.view().insert_axis(Axis(0)))
            .mapv(|w| c64::new(w, 0.0));

        let whitened: Vec<Array2<c64>> = (0..nbands)
            .into_par_iter()
            .map(|band| self.project_band(&proj, band) * &whitening)
            .collect();

        for a in 0..nbands {
            for b in 0..=a {
                let trace: c64 = (&whitened[a] * &whitened[b].t()).sum();
                fab[[a, b]] = c64::new(trace.re, 0.0);
                fab[[b, a]] = fab[[a, b]].conj();
            }
        }
        Ok(fab)
    }
}
