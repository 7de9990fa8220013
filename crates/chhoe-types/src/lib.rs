pub mod dataset;
pub mod protocol;

pub use dataset::*;
pub use protocol::*;
