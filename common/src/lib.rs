pub mod config;
pub mod error;
pub mod token;
pub mod utils;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::token::*;
pub use crate::utils::*;
