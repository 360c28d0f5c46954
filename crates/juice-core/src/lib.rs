pub mod config;
pub mod constants;
pub mod error;
pub mod telomeer;
pub mod token;
pub mod types;

pub use config::EngineConfig;
pub use constants::*;
pub use error::JuiceError;
pub use telomeer::{OwnershipProof, Telomeer};
pub use token::{Denomination, Token, TokenStatus, WisselToken};
pub use types::*;
