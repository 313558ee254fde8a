mod load;
pub mod types;
mod validate;

pub use load::{PartialConfig, load, save};
pub use types::{Config, ConfigError, PipePermissions, Result};
