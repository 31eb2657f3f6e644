use super::error::MockError;
use super::expectation::{Expectation, MockReply, Times};
use super::matcher::{CallMatcher, Operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_jobs::{
    DeleteOutcome, Destination, FailureReason, MessageHandle, Payload, SendOutcome, Transport,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What happens to a call no expectation matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback {
    /// Succeed, like an always-available platform.
    Succeed,
    /// Fail permanently and record the call as unmatched.
    Reject,
}

/// One call the engine made, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub destination: Destination,
    pub payload: Option<Payload>,
    pub handle: Option<MessageHandle>,
    pub at: DateTime<Utc>,
}

struct TransportState {
    expectations: Vec<Expectation>,
    calls: Vec<RecordedCall>,
    unmatched: Vec<RecordedCall>,
    next_handle: u64,
    fallback: Fallback,
}

/// A scripted in-memory [`Transport`].
///
/// Later expectations take precedence over earlier ones. Calls are recorded
/// whether or not they match.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Unmatched calls succeed.
    pub fn new() -> Self {
        Self::with_fallback(Fallback::Succeed)
    }

    /// Unmatched calls fail permanently and show up in [`Self::unmatched_calls`].
    pub fn strict() -> Self {
        Self::with_fallback(Fallback::Reject)
    }

    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                expectations: Vec::new(),
                calls: Vec::new(),
                unmatched: Vec::new(),
                next_handle: 1,
                fallback,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an expectation
    pub fn expect(&self, matcher: CallMatcher) -> ExpectationBuilder {
        ExpectationBuilder {
            state: Arc::clone(&self.state),
            expectation: Some(Expectation::new(matcher)),
        }
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Calls for one destination and operation
    pub fn calls_to(&self, operation: Operation, destination: &Destination) -> Vec<RecordedCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.operation == operation && &call.destination == destination)
            .cloned()
            .collect()
    }

    pub fn send_count(&self, destination: &Destination) -> usize {
        self.calls_to(Operation::Send, destination).len()
    }

    pub fn delete_count(&self, destination: &Destination) -> usize {
        self.calls_to(Operation::Delete, destination).len()
    }

    /// Get calls that didn't match any expectation
    pub fn unmatched_calls(&self) -> Vec<RecordedCall> {
        self.state().unmatched.clone()
    }

    /// Check every expectation's call count.
    pub fn try_verify(&self) -> Result<(), MockError> {
        let state = self.state();
        for exp in &state.expectations {
            if !exp.is_satisfied() {
                return Err(MockError::ExpectationUnmet {
                    matcher: format!("{:?}", exp.matcher),
                    expected: exp.times,
                    actual: exp.call_count,
                });
            }
        }
        if state.fallback == Fallback::Reject && !state.unmatched.is_empty() {
            return Err(MockError::UnmatchedCalls(state.unmatched.len()));
        }
        Ok(())
    }

    /// Verify that all expectations were met
    pub fn verify(&self) {
        if let Err(e) = self.try_verify() {
            panic!("{}", e);
        }
    }

    /// Record the call and pick the reply. The lock is released before any delay.
    fn dispatch(
        &self,
        operation: Operation,
        destination: &Destination,
        payload: Option<&Payload>,
        handle: Option<&MessageHandle>,
    ) -> (Option<MockReply>, Option<Duration>, MessageHandle) {
        let mut state = self.state();
        let call = RecordedCall {
            operation,
            destination: destination.clone(),
            payload: payload.cloned(),
            handle: handle.cloned(),
            at: Utc::now(),
        };
        state.calls.push(call.clone());

        let generated = MessageHandle::new(format!("msg-{}", state.next_handle));
        state.next_handle += 1;

        let matching = state
            .expectations
            .iter_mut()
            .rev()
            .find(|exp| exp.matcher.matches(operation, destination, payload, handle));

        match matching {
            Some(exp) => {
                let delay = exp.delay;
                (Some(exp.next_reply()), delay, generated)
            }
            None => {
                tracing::debug!(?operation, destination = %destination, "no expectation matched");
                let reply = match state.fallback {
                    Fallback::Succeed => Some(MockReply::Ok),
                    Fallback::Reject => {
                        state.unmatched.push(call);
                        None
                    }
                };
                (reply, None, generated)
            }
        }
    }
}

fn unmatched_reason() -> FailureReason {
    FailureReason::Rejected("no expectation matched".to_string())
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, destination: &Destination, payload: &Payload) -> SendOutcome {
        let (reply, delay, generated) =
            self.dispatch(Operation::Send, destination, Some(payload), None);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Some(reply) => reply.to_send(|| generated),
            None => SendOutcome::PermanentFailure(unmatched_reason()),
        }
    }

    async fn delete(&self, destination: &Destination, handle: &MessageHandle) -> DeleteOutcome {
        let (reply, delay, _) = self.dispatch(Operation::Delete, destination, None, Some(handle));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Some(reply) => reply.to_delete(),
            None => DeleteOutcome::PermanentFailure(unmatched_reason()),
        }
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MockTransport")
            .field("expectations", &state.expectations.len())
            .field("calls", &state.calls.len())
            .field("unmatched", &state.unmatched.len())
            .finish()
    }
}

pub struct ExpectationBuilder {
    state: Arc<Mutex<TransportState>>,
    expectation: Option<Expectation>,
}

impl ExpectationBuilder {
    fn map(mut self, f: impl FnOnce(Expectation) -> Expectation) -> Self {
        self.expectation = self.expectation.take().map(f);
        self
    }

    pub fn respond_with(self, reply: MockReply) -> Self {
        self.map(|exp| exp.respond_with(reply))
    }

    pub fn respond_in_sequence(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.map(|exp| exp.respond_in_sequence(replies))
    }

    pub fn delay(self, delay: Duration) -> Self {
        self.map(|exp| exp.delay(delay))
    }

    pub fn times(self, n: usize) -> Self {
        self.map(|exp| exp.times(n))
    }

    pub fn once(self) -> Self {
        self.map(Expectation::once)
    }

    pub fn at_least_once(self) -> Self {
        self.map(Expectation::at_least_once)
    }

    pub fn at_most(self, n: usize) -> Self {
        self.map(|mut exp| {
            exp.times = Times::AtMost(n);
            exp
        })
    }

    pub fn never(self) -> Self {
        self.map(Expectation::never)
    }
}

impl Drop for ExpectationBuilder {
    fn drop(&mut self) {
        if let Some(exp) = self.expectation.take() {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.expectations.push(exp);
        }
    }
}
