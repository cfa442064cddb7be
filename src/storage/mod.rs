//! Low-level storage primitives shared by the paged stores.

pub mod checksum;
