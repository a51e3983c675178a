//! Size-based choice between the exact and the Monte-Carlo Fisher estimators.
//!
//! Exact evaluation scales like `n_evals^2` to `n_evals^3` per band pair, the Monte-Carlo
//! estimate like `nsamples * n_evals`. Below `nswitch` eigenmodes the exact path is cheaper
//! and noiseless.

use crate::montecarlo::MonteCarloFisher;
use crate::progress::{FisherProgressObserver, FisherProgressStage, NoopFisherProgress};
use crate::types::{ExactFisher, FisherError, KlProjector, c64};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FisherMethod {
    Exact,
    MonteCarlo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchPolicy {
    pub nswitch: usize,
}

impl SwitchPolicy {
    pub fn choose(&self, nevals: usize) -> FisherMethod {
        if nevals < self.nswitch {
            FisherMethod::Exact
        } else {
            FisherMethod::MonteCarlo
        }
    }
}

/// Fisher matrix for one order with the method the policy picks for its eigenmode count.
pub fn fisher_m<P, E>(
    order: i32,
    policy: SwitchPolicy,
    exact: &E,
    monte_carlo: &MonteCarloFisher<'_, P>,
) -> Result<(FisherMethod, Array2<c64>), FisherError>
where
    P: KlProjector,
    E: ExactFisher + ?Sized,
{
    let method = policy.choose(monte_carlo.num_evals(order)?);
    let fab = run_method(method, order, exact, monte_carlo)?;
    Ok((method, fab))
}

fn run_method<P, E>(
    method: FisherMethod,
    order: i32,
    exact: &E,
    monte_carlo: &MonteCarloFisher<'_, P>,
) -> Result<Array2<c64>, FisherError>
where
    P: KlProjector,
    E: ExactFisher + ?Sized,
{
    match method {
        FisherMethod::Exact => exact.fisher_m(order),
        FisherMethod::MonteCarlo => monte_carlo.fisher_m_mc(order),
    }
}

/// Pairs a Monte-Carlo estimator with an injected exact one.
pub struct FisherEstimator<'p, P: KlProjector, E: ExactFisher> {
    monte_carlo: MonteCarloFisher<'p, P>,
    exact: E,
    policy: SwitchPolicy,
    forced: Option<FisherMethod>,
}

impl<'p, P: KlProjector, E: ExactFisher> FisherEstimator<'p, P, E> {
    /// The switch threshold is taken from the Monte-Carlo estimator's configuration.
    pub fn new(monte_carlo: MonteCarloFisher<'p, P>, exact: E) -> Self {
        let policy = SwitchPolicy {
            nswitch: monte_carlo.config().nswitch,
        };
        Self {
            monte_carlo,
            exact,
            policy,
            forced: None,
        }
    }

    /// Bypasses the policy and always uses `method`; `None` restores the policy.
    pub fn with_forced_method(mut self, method: Option<FisherMethod>) -> Self {
        self.forced = method;
        self
    }

    pub fn policy(&self) -> SwitchPolicy {
        self.policy
    }

    pub fn nbands(&self) -> usize {
        self.monte_carlo.nbands()
    }

    pub fn method_for(&self, order: i32) -> Result<FisherMethod, FisherError> {
        match self.forced {
            Some(method) => Ok(method),
            None => Ok(self.policy.choose(self.monte_carlo.num_evals(order)?)),
        }
    }

    /// The Monte-Carlo estimate for `order`, whatever the policy would choose.
    pub fn fisher_m_mc(&self, order: i32) -> Result<Array2<c64>, FisherError> {
        self.monte_carlo.fisher_m_mc(order)
    }

    pub fn fisher_m(&self, order: i32) -> Result<Array2<c64>, FisherError> {
        self.fisher_m_with_method(order).map(|(_, fab)| fab)
    }

    fn fisher_m_with_method(
        &self,
        order: i32,
    ) -> Result<(FisherMethod, Array2<c64>), FisherError> {
        match self.forced {
            Some(method) => Ok((
                method,
                run_method(method, order, &self.exact, &self.monte_carlo)?,
            )),
            None => fisher_m(order, self.policy, &self.exact, &self.monte_carlo),
        }
    }

    /// Sum of the per-order Fisher matrices over `orders`.
    pub fn fisher_total(&self, orders: &[i32]) -> Result<Array2<c64>, FisherError> {
        self.fisher_total_with_progress(orders, &NoopFisherProgress)
    }

    pub fn fisher_total_with_progress<O: FisherProgressObserver + ?Sized>(
        &self,
        orders: &[i32],
        progress: &O,
    ) -> Result<Array2<c64>, FisherError> {
        let nbands = self.nbands();
        progress.on_stage_start(FisherProgressStage::Orders, orders.len());

        let total = orders
            .par_iter()
            .map(|&order| -> Result<Array2<c64>, FisherError> {
                let (method, fab) = self.fisher_m_with_method(order)?;
                log::debug!("m={order} done using {method:?}.");
                progress.on_order_finish(order, method);
                Ok(fab)
            })
            .try_reduce(|| Array2::zeros((nbands, nbands)), |acc, fab| Ok(acc + fab))?;

        progress.on_stage_finish(FisherProgressStage::Orders);
        Ok(total)
    }
}
