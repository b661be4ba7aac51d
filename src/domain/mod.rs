pub mod types;
pub mod event;
pub mod watch;
pub mod policy;

pub use types::*;
pub use event::*;
pub use watch::*;
pub use policy::*;
