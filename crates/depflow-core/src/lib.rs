//! Core types and collaborator contracts for depflow, the dependency tracking
//! and dirt propagation engine of the content platform.

pub mod config_manager;
pub mod error;
pub mod events;
pub mod logging;
pub mod object;
pub mod registry;
pub mod traits;
pub mod types;

pub use config_manager::*;
pub use error::*;
pub use events::*;
pub use logging::*;
pub use object::*;
pub use registry::*;
pub use traits::*;
pub use types::*;
