//! Request and response types for the registry API.

pub mod entries;
