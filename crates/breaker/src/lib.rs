pub mod controller;

pub use controller::{
    Admission, AdmissionController, BreakerConfig, BreakerSnapshot, BreakerStatus,
    DirectionSnapshot,
};
