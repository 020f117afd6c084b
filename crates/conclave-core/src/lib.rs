pub mod connection;
pub mod engine;
pub mod observation;

pub use connection::{ConnError, ConnectionManager};
pub use engine::{CatalogEntry, ContactBook, CoordinationEngine, EngineConfig, EngineError, ModelRoute, RouterClient};
pub use observation::{render_observation_section, ObservationAdapter};
