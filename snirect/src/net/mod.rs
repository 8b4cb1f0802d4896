pub mod device;
pub mod stack;

pub use device::ByteCounters;
pub use stack::{IpStack, StackConnection, StackEvent};
