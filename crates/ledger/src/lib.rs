pub mod ledger;
pub mod math;
pub mod memory;

pub use ledger::{
    CloseOutcome, ClosedPosition, CloseRequest, Ledger, LedgerConfig, OpenOutcome, OpenRequest,
};
pub use memory::MemoryStore;
