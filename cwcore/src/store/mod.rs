pub mod error;
pub mod record;
pub mod traits;

pub use error::{Result, SignalStoreError};
pub use record::{DeliveredSignal, RetentionPolicy, SignalRecord};
pub use traits::SignalStore;
