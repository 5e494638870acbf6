pub mod engine;
pub mod models;
pub mod store;

pub use engine::{EngineSettings, PinEngine};
pub use models::{window_hours, PinRecord, PinSource, PinStatus, MAX_WINDOW_HOURS};
pub use store::{LeaseOwner, PinStore};
