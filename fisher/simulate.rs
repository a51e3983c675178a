use crate::types::c64;
use ndarray::{Array2, ArrayView3};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::FRAC_1_SQRT_2;

/// Simulates one set of `a_lm(nu)` for a single `m` from a transfer matrix built by
/// [`crate::transfer::block_root`].
///
/// The realization is drawn as if `m = 0`; callers working at larger `|m|` ignore the entries
/// with `l < |m|`. Returns a `[n_freq, n_ell]` array whose `l` column has covariance
/// `trans[l] trans[l]^H`.
pub fn sim_skyvec<R: Rng + ?Sized>(trans: ArrayView3<'_, c64>, rng: &mut R) -> Array2<c64> {
    let (nell, nfreq, ncols) = trans.dim();
    debug_assert_eq!(nfreq, ncols);

    let gaussvars = Array2::from_shape_fn((nell, ncols), |_| {
        let re: f64 = rng.sample(StandardNormal);
        let im: f64 = rng.sample(StandardNormal);
        c64::new(re * FRAC_1_SQRT_2, im * FRAC_1_SQRT_2)
    });

    let mut sky = Array2::zeros((nfreq, nell));
    for (ell, (block, noise)) in trans.outer_iter().zip(gaussvars.outer_iter()).enumerate() {
        sky.column_mut(ell).assign(&block.dot(&noise));
    }
    sky
}
