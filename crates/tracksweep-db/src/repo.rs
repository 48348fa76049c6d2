//! Repository implementations.

pub mod run;

pub use run::{PgRunStore, RunRow};
