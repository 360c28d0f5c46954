pub mod clock;
pub mod selection;

pub use clock::{DenominationStatus, DenominationVectorClock};
pub use selection::{
    select_tokens, select_tokens_with_tail, validate_selection, Holdings, Selection,
};
