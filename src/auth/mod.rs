//! Authentication mechanisms for the bundled Postgres driver

pub mod scram;

pub use scram::{ScramClient, ScramError, ScramState, MECHANISM as SCRAM_MECHANISM};
