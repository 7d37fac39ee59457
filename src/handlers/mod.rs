pub mod claims;
pub mod config;
pub mod sessions;

pub use claims::*;
pub use config::*;
pub use sessions::*;
