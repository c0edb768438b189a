//! Request handlers for the remote side of a sync round.

mod changes;
mod scope;

pub use changes::*;
pub use scope::*;
