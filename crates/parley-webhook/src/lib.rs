//! # parley-webhook
//!
//! Everything needed to accept an agent's asynchronous callback safely:
//!
//! - [`canonical`]: key-sorted compact JSON, the byte form that gets signed
//! - [`signature`]: `sha256=<hex>` HMAC signatures with a freshness window
//! - [`callback_url`]: the URL an agent is told to call back on

#![deny(unsafe_code)]

pub mod callback_url;
pub mod canonical;
pub mod signature;

pub use callback_url::{CallbackUrlTemplate, UrlTemplateError};
pub use canonical::to_canonical_string;
pub use signature::{sign, verify, NotificationVerifier, DEFAULT_TOLERANCE, SIGNATURE_PREFIX};
