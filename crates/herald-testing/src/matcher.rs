use herald_jobs::{Destination, MessageHandle, Payload};
use serde_json::Value;

/// Which transport operation a call was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Send,
    Delete,
}

/// Matcher for transport calls
#[derive(Debug, Clone, Default)]
pub struct CallMatcher {
    pub(crate) operation: Option<Operation>,
    pub(crate) destination: Option<Destination>,
    pub(crate) payload_json: Option<Value>,
    pub(crate) handle: Option<MessageHandle>,
}

impl CallMatcher {
    /// Create a new matcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Match `send` calls only
    pub fn send() -> Self {
        Self::new().operation(Operation::Send)
    }

    /// Match `delete` calls only
    pub fn delete() -> Self {
        Self::new().operation(Operation::Delete)
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Match a specific destination
    pub fn destination(mut self, destination: impl Into<Destination>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Match exact JSON payload
    pub fn payload_json(mut self, payload: Value) -> Self {
        self.payload_json = Some(payload);
        self
    }

    /// Match the handle of a delete call
    pub fn handle(mut self, handle: impl Into<MessageHandle>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    /// Check if the matcher matches a call
    pub fn matches(
        &self,
        operation: Operation,
        destination: &Destination,
        payload: Option<&Payload>,
        handle: Option<&MessageHandle>,
    ) -> bool {
        if let Some(op) = self.operation {
            if op != operation {
                return false;
            }
        }

        if let Some(d) = &self.destination {
            if d != destination {
                return false;
            }
        }

        if let Some(expected) = &self.payload_json {
            match payload {
                Some(actual) if actual.as_value() == expected => {}
                _ => return false,
            }
        }

        if let Some(expected) = &self.handle {
            if handle != Some(expected) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn destination_strategy() -> impl Strategy<Value = Destination> {
        prop_oneof![
            prop::string::string_regex("@[a-z]{3,10}")
                .unwrap()
                .prop_map(Destination::from),
            (-1_009_999_999_999i64..-1_000_000_000_000i64).prop_map(Destination::from),
        ]
    }

    fn operation_strategy() -> impl Strategy<Value = Operation> {
        prop_oneof![Just(Operation::Send), Just(Operation::Delete)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_empty_matcher_matches_all(
            operation in operation_strategy(),
            destination in destination_strategy(),
            text in "[a-zA-Z0-9 ]{0,40}",
        ) {
            let payload = Payload::new(json!({"text": text}));
            prop_assert!(CallMatcher::new().matches(operation, &destination, Some(&payload), None));
        }

        #[test]
        fn prop_destination_matcher_exact(
            target in destination_strategy(),
            other in destination_strategy(),
        ) {
            let matcher = CallMatcher::send().destination(target.clone());
            prop_assert!(matcher.matches(Operation::Send, &target, None, None));
            prop_assert!(!matcher.matches(Operation::Delete, &target, None, None));
            if target != other {
                prop_assert!(!matcher.matches(Operation::Send, &other, None, None));
            }
        }

        #[test]
        fn prop_payload_matcher_requires_payload(
            destination in destination_strategy(),
            text in "[a-z]{1,20}",
            other in "[A-Z]{1,20}",
        ) {
            let matcher = CallMatcher::new().payload_json(json!({"text": text}));
            let same = Payload::new(json!({"text": text}));
            let different = Payload::new(json!({"text": other}));

            prop_assert!(matcher.matches(Operation::Send, &destination, Some(&same), None));
            prop_assert!(!matcher.matches(Operation::Send, &destination, Some(&different), None));
            prop_assert!(!matcher.matches(Operation::Delete, &destination, None, None));
        }
    }
}
