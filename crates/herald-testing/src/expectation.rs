use super::matcher::CallMatcher;
use herald_jobs::{DeleteOutcome, FailureReason, MessageHandle, SendOutcome};
use std::collections::VecDeque;
use std::time::Duration;

/// A scripted answer to one transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Success. Sends get a generated handle, deletes report `Deleted`.
    Ok,
    /// Successful send with a fixed handle.
    DeliveredAs(MessageHandle),
    Throttled(Duration),
    Unavailable(String),
    Fail(FailureReason),
    /// Delete only: the message was already removed.
    AlreadyGone,
}

impl MockReply {
    pub(crate) fn to_send(&self, generated: impl FnOnce() -> MessageHandle) -> SendOutcome {
        match self {
            MockReply::Ok | MockReply::AlreadyGone => SendOutcome::Delivered(generated()),
            MockReply::DeliveredAs(handle) => SendOutcome::Delivered(handle.clone()),
            MockReply::Throttled(wait) => SendOutcome::Throttled(*wait),
            MockReply::Unavailable(error) => SendOutcome::Unavailable(error.clone()),
            MockReply::Fail(reason) => SendOutcome::PermanentFailure(reason.clone()),
        }
    }

    pub(crate) fn to_delete(&self) -> DeleteOutcome {
        match self {
            MockReply::Ok | MockReply::DeliveredAs(_) => DeleteOutcome::Deleted,
            MockReply::AlreadyGone => DeleteOutcome::AlreadyGone,
            MockReply::Throttled(wait) => DeleteOutcome::Throttled(*wait),
            MockReply::Unavailable(error) => DeleteOutcome::Unavailable(error.clone()),
            MockReply::Fail(reason) => DeleteOutcome::PermanentFailure(reason.clone()),
        }
    }
}

/// An expectation for transport calls
#[derive(Debug, Clone)]
pub struct Expectation {
    pub(crate) matcher: CallMatcher,
    /// Replies consumed in order; the last one repeats.
    pub(crate) replies: VecDeque<MockReply>,
    pub(crate) delay: Option<Duration>,
    pub(crate) times: Times,
    pub(crate) call_count: usize,
}

impl Expectation {
    /// Create a new expectation
    pub fn new(matcher: CallMatcher) -> Self {
        Self {
            matcher,
            replies: VecDeque::from([MockReply::Ok]),
            delay: None,
            times: Times::Any,
            call_count: 0,
        }
    }

    /// Always answer with `reply`
    pub fn respond_with(mut self, reply: MockReply) -> Self {
        self.replies = VecDeque::from([reply]);
        self
    }

    /// Answer successive calls with `replies`, repeating the last one
    pub fn respond_in_sequence(mut self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        let replies: VecDeque<MockReply> = replies.into_iter().collect();
        if !replies.is_empty() {
            self.replies = replies;
        }
        self
    }

    /// Sleep before answering
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Expect exactly one call
    pub fn once(mut self) -> Self {
        self.times = Times::Once;
        self
    }

    /// Expect exactly n calls
    pub fn times(mut self, n: usize) -> Self {
        self.times = Times::Exactly(n);
        self
    }

    /// Expect at least one call
    pub fn at_least_once(mut self) -> Self {
        self.times = Times::AtLeast(1);
        self
    }

    /// Expect no calls at all
    pub fn never(mut self) -> Self {
        self.times = Times::Exactly(0);
        self
    }

    /// Take the reply for the next call
    pub(crate) fn next_reply(&mut self) -> MockReply {
        self.call_count += 1;
        if self.replies.len() > 1 {
            self.replies.pop_front().unwrap_or(MockReply::Ok)
        } else {
            self.replies.front().cloned().unwrap_or(MockReply::Ok)
        }
    }

    /// Whether the call count satisfies `times`
    pub fn is_satisfied(&self) -> bool {
        self.times.allows(self.call_count)
    }
}

/// Define how many times an expectation should be matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Times {
    Once,
    Exactly(usize),
    AtLeast(usize),
    AtMost(usize),
    Any,
}

impl Times {
    pub fn allows(&self, count: usize) -> bool {
        match *self {
            Times::Once => count == 1,
            Times::Exactly(n) => count == n,
            Times::AtLeast(n) => count >= n,
            Times::AtMost(n) => count <= n,
            Times::Any => true,
        }
    }
}

impl std::fmt::Display for Times {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Times::Once => write!(f, "exactly 1"),
            Times::Exactly(n) => write!(f, "exactly {}", n),
            Times::AtLeast(n) => write!(f, "at least {}", n),
            Times::AtMost(n) => write!(f, "at most {}", n),
            Times::Any => write!(f, "any number of"),
        }
    }
}
