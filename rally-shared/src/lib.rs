pub mod events;
pub mod pii;

pub use events::SlotEvent;
pub use pii::Masked;
