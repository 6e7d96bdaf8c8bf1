pub mod kv;
pub mod local;

pub use kv::*;
pub use local::*;
