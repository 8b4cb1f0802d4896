pub mod dns_intercept;
pub mod speed;
pub mod tcp;
pub mod udp;

pub use tcp::{FlowContext, PrefixStream};
