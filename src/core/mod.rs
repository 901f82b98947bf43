pub mod cancel;
pub mod config;
pub mod error;

pub use cancel::*;
pub use config::*;
pub use error::*;
