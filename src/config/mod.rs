pub mod load;
pub mod schema;

pub use load::{default_config_path, default_state_path, resolve_config_path};
pub use schema::*;
