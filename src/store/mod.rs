pub mod memory;

pub use cwcore::store::{DeliveredSignal, RetentionPolicy, SignalStore, SignalStoreError};
pub use memory::MemorySignalStore;
