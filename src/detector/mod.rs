pub mod detector;
pub mod ids;
pub mod page;

pub use detector::*;
pub use ids::*;
pub use page::*;
