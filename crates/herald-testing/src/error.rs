use crate::expectation::Times;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MockError {
    #[error("Expectation {matcher} expected {expected} calls, got {actual}")]
    ExpectationUnmet {
        matcher: String,
        expected: Times,
        actual: usize,
    },

    #[error("{0} transport calls matched no expectation")]
    UnmatchedCalls(usize),
}
