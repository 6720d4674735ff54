//! Persistence of captured artifacts into the observation store.

mod writer;

pub use writer::{PersistError, PersistReport, PersistenceWriter};
