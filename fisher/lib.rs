#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod config;
pub mod dispatch;
pub mod exact;
pub mod montecarlo;
pub mod progress;
pub mod simulate;
pub mod synthetic;
pub mod transfer;
pub mod types;

pub use config::{ConfigError, EstimatorConfig, RunConfig};
pub use dispatch::{FisherEstimator, FisherMethod, SwitchPolicy};
pub use exact::DirectTraceFisher;
pub use montecarlo::{MonteCarloFisher, SampleCache, fisher_from_cache};
pub use progress::{FisherProgressObserver, FisherProgressStage, NoopFisherProgress};
pub use synthetic::{SyntheticTelescope, SyntheticTelescopeConfig};
pub use transfer::TransferArray;
pub use types::{ExactFisher, FisherError, KlModes, KlProjector, SkyModel, c64};
