pub mod attestation;
pub mod source;
pub mod spoof;

pub use attestation::{TimeAuthority, TimeIntegrity, TimeStatus, TimeWeights};
pub use source::{
    FixedTimeSource, SourceType, SteppingTimeSource, SystemTimeSource, TimeSource,
    TimeSourceReading,
};
pub use spoof::{SpoofDetector, SpoofKind};
