//! Built-in transformations applied to outgoing messages before delivery.
//!
//! Currently provides S/MIME signing with per-sender credentials.

pub mod smime_sign;

pub use smime_sign::*;
