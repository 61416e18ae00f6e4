//! Fatal bisection errors.
//!
//! A probe that crashes, times out or prints the wrong output is not an
//! error; it is the `false` answer the search is built around. The variants
//! here abort a whole run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BisectionError {
    /// The compiler's `--dump-passes` output did not have the expected shape.
    #[error("Not recognized --dump-passes output format: {0}")]
    DumpFormat(String),

    /// A boundary result that a consistent baseline can never produce.
    #[error("Search contract violated: {0}")]
    ContractViolation(String),

    /// The test environment could not be set up or reached.
    #[error("Test environment failure: {0}")]
    Environment(String),
}
