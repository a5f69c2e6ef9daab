//! Orchestration: sensor synchronisation and the pipeline driver.

mod lio;
mod sync;

pub use lio::{EngineState, LioEngine, SensorIntake, INIT_TIME};
pub use sync::{MeasureSync, SyncConfig};
