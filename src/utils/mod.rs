//! The `utils` module provides definitions shared across `peril_pubsub`:
//! the error taxonomy and logging initialisation.

pub mod error;
pub mod logging;
