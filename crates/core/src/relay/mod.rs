mod deadline;
mod duplex;
mod splice;

pub use deadline::DeadlineStream;
pub use duplex::DuplexRelay;
pub use splice::{copy_stream, join_streams, race_streams};
