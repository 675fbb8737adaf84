//! Route handlers for the registry API.

pub mod entries;
