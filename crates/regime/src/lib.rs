pub mod classifier;
pub mod hysteresis;
pub mod indicators;

pub use classifier::{Classification, ClassifierConfig, RegimeClassifier};
pub use hysteresis::{Hysteresis, HysteresisConfig};
