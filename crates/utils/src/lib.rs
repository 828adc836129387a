//! S/MIME signing gate for outbound mail pipelines.
//!
//! Decides whether an outgoing message may be signed (the `From` header
//! must match the envelope sender and the sender must be allowed), finds
//! the sender's credential bundle and signs the message with an external
//! `openssl smime` process. See [`SmimeSignTransformer`] for the entry point.

pub mod config;
pub mod credentials;
pub mod message;
pub mod mime;
pub mod policy;
pub mod signer;
pub mod transformer;
pub mod transformers;

pub use config::*;
pub use credentials::*;
pub use message::*;
pub use mime::*;
pub use policy::*;
pub use signer::*;
pub use transformer::*;
pub use transformers::*;
