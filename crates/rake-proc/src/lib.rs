pub mod command;
pub mod error;
pub mod launch;
pub mod registry;
pub mod table;
pub mod terminate;

pub use command::*;
pub use error::*;
pub use launch::*;
pub use registry::*;
pub use table::*;
pub use terminate::*;
