pub mod config;
pub mod controller;
pub mod event_bus;
pub mod pool;
pub mod searcher;
pub mod validity;
mod worker;

pub use config::*;
pub use controller::*;
pub use event_bus::*;
pub use pool::*;
pub use searcher::*;
pub use validity::*;
