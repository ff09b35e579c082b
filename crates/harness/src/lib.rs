pub mod inventory;
pub mod scripted;

pub use inventory::{TestInventory, device, observation};
pub use scripted::{RecordingPause, ScriptedBatch, permanent, sqlite_busy, transient};
