pub mod egg;
pub mod renewal;

pub use egg::{DormantEgg, EggStage, FertilizationTrigger, HatchingCondition};
pub use renewal::{scan_expiring, ExpiryNotification, RenewalTransformation};
