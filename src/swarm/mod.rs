// swarm/mod.rs

// The tracker and peer processes plus the typed channels between them.
pub mod common;
pub mod model;
pub mod message;
pub mod transport;
pub mod tracker;
pub mod peer;
pub mod input;
pub mod output;
pub mod session;

pub use common::SwarmError;
pub use input::{load_all, InputDirSource};
pub use output::OutputDirSink;
pub use session::{run_session, SessionReport};
