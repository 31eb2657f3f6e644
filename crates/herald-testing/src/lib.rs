//! Testing utilities for Herald
//!
//! The [`MockTransport`] stands in for a messaging platform: script replies
//! per destination, run the engine, then inspect the recorded calls and
//! verify call counts.
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport
//!     .expect(CallMatcher::send().destination("@news"))
//!     .respond_with(MockReply::Throttled(Duration::from_secs(5)))
//!     .times(3);
//! ```

pub mod error;
pub mod expectation;
pub mod matcher;
pub mod transport;

pub use error::MockError;
pub use expectation::{Expectation, MockReply, Times};
pub use matcher::{CallMatcher, Operation};
pub use transport::{ExpectationBuilder, MockTransport, RecordedCall};
