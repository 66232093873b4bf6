//! Session orchestration and storage for agent engine clients.
//!
//! Provides:
//! - `SessionController` - Drive the per-session query cycle
//! - Storage implementations (memory)

pub mod controller;
pub mod storage;

pub use controller::{ControllerError, SessionController, TurnOutcome};
