//! Serde shapes of the lifecycle entrypoints and their results.

mod messages;

pub use messages::*;
