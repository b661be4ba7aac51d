pub mod ports;
pub mod scheduler;
pub mod usecases;

pub use ports::*;
