//! Wire models of the catalog and keys APIs.

pub mod models;
