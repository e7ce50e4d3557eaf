//! Pieces shared by the `linepipe` and `linepipe-peer` binaries.
//!
//! Not a stable API; enabled with the `cli` feature.

pub mod exit;
pub mod logging;
pub mod support;
