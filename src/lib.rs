//! Bisection search for miscompilations.
//!
//! Given a program whose compiled-and-run output differs from a known good
//! output, finds the compiled method responsible and the optimization pass
//! that first breaks it.

pub mod config;
pub mod env;
pub mod error;
pub mod report;
pub mod search;
pub mod testable;
pub mod util;
