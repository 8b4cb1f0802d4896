//! Core engine: a transparent, on-device TLS-intercepting proxy driven by a
//! virtual network device (see SPEC_FULL.md for the full module map).
//!
//! Mirrors `ferron`/`ferron-common`'s split between a shared types crate
//! (`snirect-common`) and the engine crate (this one) that does the work.

pub mod ca;
pub mod dns;
pub mod flow;
pub mod net;
pub mod pattern;
pub mod protect;
pub mod remote;
pub mod rules;
pub mod sni;
pub mod supervisor;
pub mod tls_verify;

pub use ca::CertificateAuthority;
pub use protect::ProtectedDialer;
pub use rules::RuleEngine;
pub use supervisor::Supervisor;
