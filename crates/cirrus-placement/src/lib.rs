//! Cirrus Placement - consistent-hash replica placement
//!
//! Maps `bucket/key` to an ordered list of distinct storage nodes using a
//! hash ring with virtual nodes. Adding or removing a node only moves the
//! keys whose ring arc changed hands.

pub mod ring;

pub use ring::{HashRing, hash32, placement_key};
