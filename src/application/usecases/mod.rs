pub mod dispatch;
pub mod manage_watches;
pub mod run_once;

pub use dispatch::*;
pub use manage_watches::*;
pub use run_once::*;
