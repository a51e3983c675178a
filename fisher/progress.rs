use std::fmt;

use crate::dispatch::FisherMethod;

/// Stages reported while estimating a Fisher matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FisherProgressStage {
    Orders,
}

impl FisherProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Orders => "per-m Fisher accumulation",
        }
    }
}

impl fmt::Display for FisherProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress over azimuthal orders.
///
/// Orders are processed in parallel, so callbacks arrive from worker threads in no
/// particular order.
pub trait FisherProgressObserver: Sync {
    fn on_stage_start(&self, stage: FisherProgressStage, total: usize) {
        let _ = (stage, total);
    }
    fn on_order_finish(&self, order: i32, method: FisherMethod) {
        let _ = (order, method);
    }
    fn on_stage_finish(&self, stage: FisherProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopFisherProgress;

impl FisherProgressObserver for NoopFisherProgress {}
