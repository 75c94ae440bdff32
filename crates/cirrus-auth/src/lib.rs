//! Cirrus Auth - presigned URL capabilities
//!
//! A presigned URL authorises one HTTP method on one object path until an
//! expiration time. The signature is an HMAC-SHA256 over
//! `METHOD\npath\nexpires` keyed with the process-wide storage secret.
//! Possession of the URL is the authorisation; no identity is carried.

pub mod presign;

pub use presign::{PRESIGN_PREFIX, PresignedUrl, Presigner, presigned_path};
