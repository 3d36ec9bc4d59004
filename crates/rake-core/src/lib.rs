pub mod config;
pub mod index;
pub mod message;
pub mod types;
pub mod validation;

pub use config::*;
pub use index::*;
pub use message::*;
pub use types::*;
pub use validation::*;
