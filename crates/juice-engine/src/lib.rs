pub mod cancel;
pub mod engine;
pub mod pak;
pub mod resolution;
pub mod state;
pub mod trust;
pub mod wire;

pub use cancel::{CancelHandle, CancelToken};
pub use engine::{TransactionEngine, TransactionReceipt};
pub use pak::Pak;
pub use state::{TxPhase, TxRole};
pub use trust::TrustAttestation;
pub use wire::{Envelope, MessageBody};
