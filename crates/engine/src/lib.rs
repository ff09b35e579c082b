pub mod error;
pub mod gate;
pub mod identity;
pub mod retry;
pub mod sightings;
pub mod writer;

pub use error::EngineError;
pub use gate::WriteGate;
pub use identity::{IdentifierReport, IdentityConflict, IdentityResolver};
pub use retry::{Pause, RetryController, RetryError, ThreadPause};
pub use sightings::{ObserveReport, SightingLifecycle};
pub use writer::{InventoryWriter, WriteReport};
