pub mod config;
pub mod durability;
pub mod ids;
pub mod util;

pub use durability::DurabilityMode;
pub use ids::{IndexId, TxnId};
