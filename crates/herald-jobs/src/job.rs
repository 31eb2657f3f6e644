//! Job records and their state machine.
//!
//! A [`JobRecord`] is the unit the store owns. All state transitions are
//! implemented here as plain methods taking an explicit `now`, so every
//! backend applies exactly the same rules.

use crate::error::{JobError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique, time-sortable job identifier (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifies one particular lease of a job.
///
/// Every call to [`JobRecord::acquire_lease`] mints a new token, so a worker
/// that re-leases a job after its own lease expired holds a different token
/// than the dispatch still running under the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A channel or chat the content is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(String);

impl Destination {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Destination {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Destination {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<i64> for Destination {
    fn from(chat_id: i64) -> Self {
        Self(chat_id.to_string())
    }
}

/// Platform handle of a delivered message, needed to delete it later.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHandle(String);

impl MessageHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<i64> for MessageHandle {
    fn from(message_id: i64) -> Self {
        Self(message_id.to_string())
    }
}

/// Opaque content descriptor. Only the transport interprets it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(serde_json::Value);

impl Payload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobBody {
    /// Send `payload` to every destination.
    Publish {
        payload: Payload,
        #[serde(default, with = "duration_ms_opt")]
        auto_delete_after: Option<Duration>,
    },
    /// Delete previously delivered messages.
    Delete {
        /// The publish job whose delivery spawned this one.
        parent: Option<JobId>,
        handles: BTreeMap<Destination, MessageHandle>,
    },
}

impl JobBody {
    pub fn kind(&self) -> JobKind {
        match self {
            JobBody::Publish { .. } => JobKind::Publish,
            JobBody::Delete { .. } => JobKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Publish,
    Delete,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Publish => "publish",
            JobKind::Delete => "delete",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate job state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet dispatched.
    Pending,
    /// Dispatch has started; no destination delivered yet.
    ///
    /// The state persists between dispatch passes while retries are
    /// pending, so it does not mean a worker is running right now. Use
    /// [`JobRecord::is_waiting`] for that.
    InFlight,
    /// Some destinations delivered. Final only when `partial_success` is set.
    PartiallyDelivered,
    Delivered,
    Failed,
    Cancelled,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::InFlight => 1,
            JobState::PartiallyDelivered => 2,
            JobState::Delivered | JobState::Failed | JobState::Cancelled => 3,
        }
    }

    /// Delivered, Failed and Cancelled never change again.
    pub fn is_final(self) -> bool {
        self.rank() == 3
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::PartiallyDelivered => "partially_delivered",
            JobState::Delivered => "delivered",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "in_flight" => Ok(JobState::InFlight),
            "partially_delivered" => Ok(JobState::PartiallyDelivered),
            "delivered" => Ok(JobState::Delivered),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(JobError::BackendError(format!("unknown job state: {}", other))),
        }
    }
}

/// Why a destination will never be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// `max_attempts` transport calls were made without success.
    RetryExhausted,
    /// The bot lost its rights on the destination (kicked, demoted, ...).
    Unauthorized,
    /// The destination does not exist (anymore).
    DestinationNotFound,
    /// The platform rejected the content or the request.
    Rejected(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RetryExhausted => f.write_str("retry exhausted"),
            FailureReason::Unauthorized => f.write_str("destination unauthorized"),
            FailureReason::DestinationNotFound => f.write_str("destination not found"),
            FailureReason::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

/// Per-destination delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DestinationOutcome {
    NotAttempted,
    Delivered {
        handle: MessageHandle,
        delivered_at: DateTime<Utc>,
        attempts: u32,
    },
    RetryScheduled {
        next_attempt_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<String>,
    },
    PermanentlyFailed {
        reason: FailureReason,
        attempts: u32,
    },
}

impl DestinationOutcome {
    /// Delivered and permanently failed outcomes are final.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            DestinationOutcome::Delivered { .. } | DestinationOutcome::PermanentlyFailed { .. }
        )
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DestinationOutcome::Delivered { .. })
    }

    /// Number of transport calls made so far.
    pub fn attempts(&self) -> u32 {
        match self {
            DestinationOutcome::NotAttempted => 0,
            DestinationOutcome::Delivered { attempts, .. }
            | DestinationOutcome::RetryScheduled { attempts, .. }
            | DestinationOutcome::PermanentlyFailed { attempts, .. } => *attempts,
        }
    }

    /// Retries consumed: attempts beyond the first one.
    pub fn retries(&self) -> u32 {
        self.attempts().saturating_sub(1)
    }

    pub fn handle(&self) -> Option<&MessageHandle> {
        match self {
            DestinationOutcome::Delivered { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// When this destination may next be attempted; `None` once resolved.
    pub fn ready_at(&self, due_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            DestinationOutcome::NotAttempted => Some(due_at),
            DestinationOutcome::RetryScheduled {
                next_attempt_at, ..
            } => Some(*next_attempt_at),
            _ => None,
        }
    }
}

/// Time-bounded exclusive claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    #[serde(default)]
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A scheduled publish or delete job, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner: Option<String>,
    pub body: JobBody,
    pub due_at: DateTime<Utc>,
    pub state: JobState,
    pub outcomes: BTreeMap<Destination, DestinationOutcome>,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the job ended with a mix of delivered and failed destinations.
    #[serde(default)]
    pub partial_success: bool,
    #[serde(default)]
    pub cancel_requested: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub lease: Option<Lease>,
    /// Delete jobs spawned by deliveries of this job.
    #[serde(default)]
    pub follow_ups: Vec<JobId>,
    /// How many times the job has been leased for dispatch.
    #[serde(default)]
    pub dispatch_count: u32,
}

impl JobRecord {
    /// Build a publish job. Duplicate destinations are collapsed.
    pub fn publish<I>(
        payload: Payload,
        destinations: I,
        due_at: DateTime<Utc>,
        max_attempts: u32,
        auto_delete_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Destination>,
    {
        if auto_delete_after == Some(Duration::ZERO) {
            return Err(JobError::InvalidJob(
                "auto-delete delay must be greater than zero".to_string(),
            ));
        }

        let body = JobBody::Publish {
            payload,
            auto_delete_after,
        };
        Self::build(body, destinations, due_at, max_attempts, now)
    }

    /// Build a delete job for the given (destination, handle) pairs.
    pub fn delete(
        parent: Option<JobId>,
        handles: BTreeMap<Destination, MessageHandle>,
        due_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let destinations: Vec<Destination> = handles.keys().cloned().collect();
        let body = JobBody::Delete { parent, handles };
        Self::build(body, destinations, due_at, max_attempts, now)
    }

    fn build<I>(
        body: JobBody,
        destinations: I,
        due_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Destination>,
    {
        let mut outcomes = BTreeMap::new();
        for destination in destinations {
            if destination.as_str().trim().is_empty() {
                return Err(JobError::InvalidJob("destination id is empty".to_string()));
            }
            outcomes.insert(destination, DestinationOutcome::NotAttempted);
        }

        if outcomes.is_empty() {
            return Err(JobError::InvalidJob(
                "a job needs at least one destination".to_string(),
            ));
        }
        if max_attempts == 0 {
            return Err(JobError::InvalidJob(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            id: JobId::new(),
            owner: None,
            body,
            due_at,
            state: JobState::Pending,
            outcomes,
            max_attempts,
            created_at: now,
            updated_at: now,
            finished_at: None,
            partial_success: false,
            cancel_requested: false,
            cancelled_at: None,
            cancellation_reason: None,
            lease: None,
            follow_ups: Vec::new(),
            dispatch_count: 0,
        })
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.body.kind()
    }

    pub fn destinations(&self) -> impl Iterator<Item = &Destination> {
        self.outcomes.keys()
    }

    pub fn outcome(&self, destination: &Destination) -> Option<&DestinationOutcome> {
        self.outcomes.get(destination)
    }

    pub fn auto_delete_after(&self) -> Option<Duration> {
        match &self.body {
            JobBody::Publish {
                auto_delete_after, ..
            } => *auto_delete_after,
            JobBody::Delete { .. } => None,
        }
    }

    /// Final: delivered, failed, cancelled, or partially delivered with
    /// nothing left to retry.
    pub fn is_terminal(&self) -> bool {
        self.state.is_final() || self.finished_at.is_some()
    }

    /// Earliest time any unresolved destination may be attempted.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        if self.is_terminal() {
            return None;
        }
        self.outcomes
            .values()
            .filter_map(|outcome| outcome.ready_at(self.due_at))
            .min()
    }

    /// Time at which the scheduler should look at this job again.
    ///
    /// A held lease pushes it to the lease expiry, so a job is only offered
    /// again once its worker is presumed dead. A non-terminal job whose
    /// destinations are all resolved (worker died before releasing) is due
    /// at `due_at` so it can be settled.
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        if self.is_terminal() {
            return None;
        }
        let base = self.next_attempt_at().unwrap_or(self.due_at);
        Some(match &self.lease {
            Some(lease) => base.max(lease.expires_at),
            None => base,
        })
    }

    /// Destinations to attempt in a dispatch pass started at `now`.
    pub fn ready_destinations(&self, now: DateTime<Utc>) -> Vec<Destination> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| {
                outcome
                    .ready_at(self.due_at)
                    .map(|at| at <= now)
                    .unwrap_or(false)
            })
            .map(|(destination, _)| destination.clone())
            .collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_delivered()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, DestinationOutcome::PermanentlyFailed { .. }))
            .count()
    }

    fn advance(&mut self, to: JobState) {
        if to.rank() >= self.state.rank() {
            self.state = to;
        }
    }

    /// Claim the job for `owner` until `now + ttl`.
    pub fn acquire_lease(
        &mut self,
        owner: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseToken> {
        if self.is_terminal() {
            return Err(JobError::AlreadyTerminal(self.id));
        }
        if let Some(lease) = &self.lease {
            if lease.is_active(now) {
                return Err(JobError::AlreadyLeased(self.id));
            }
            tracing::debug!(
                job_id = %self.id,
                previous_owner = %lease.owner,
                "taking over expired lease"
            );
        }

        let token = LeaseToken::new();
        self.lease = Some(Lease {
            owner: owner.to_string(),
            token,
            expires_at: add_signed(now, ttl),
        });
        self.advance(JobState::InFlight);
        self.dispatch_count += 1;
        self.updated_at = now;
        Ok(token)
    }

    /// Token of the current lease, if any.
    pub fn lease_token(&self) -> Option<LeaseToken> {
        self.lease.as_ref().map(|lease| lease.token)
    }

    /// Ensure `token` is still the current lease.
    ///
    /// An expired lease that nobody has claimed since is still honoured.
    /// Once the job is leased again, even by the same worker, the old token
    /// is rejected.
    pub fn check_lease(&self, token: &LeaseToken) -> Result<()> {
        match &self.lease {
            Some(lease) if lease.token == *token => Ok(()),
            _ => Err(JobError::LeaseLost(self.id)),
        }
    }

    /// Not terminal and not held by any worker: the job is waiting for its
    /// next due or retry time.
    pub fn is_waiting(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal()
            && !self
                .lease
                .as_ref()
                .map(|lease| lease.is_active(now))
                .unwrap_or(false)
    }

    /// Record one destination outcome. Resolved outcomes never change.
    pub fn record_outcome(
        &mut self,
        destination: &Destination,
        outcome: DestinationOutcome,
        follow_up: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_terminal() {
            return Err(JobError::AlreadyTerminal(self.id));
        }

        let current = self
            .outcomes
            .get_mut(destination)
            .ok_or_else(|| JobError::UnknownDestination {
                job: self.id,
                destination: destination.clone(),
            })?;

        if current.is_resolved() {
            return Err(JobError::OutcomeRegression {
                job: self.id,
                destination: destination.clone(),
            });
        }

        *current = outcome;
        if let Some(follow_up) = follow_up {
            self.follow_ups.push(follow_up);
        }
        if self.delivered_count() > 0 {
            self.advance(JobState::PartiallyDelivered);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Drop the lease and derive the aggregate state from the outcomes.
    pub fn settle(&mut self, now: DateTime<Utc>) {
        self.lease = None;
        self.updated_at = now;

        if self.is_terminal() {
            return;
        }

        if self.cancel_requested {
            self.state = JobState::Cancelled;
            self.cancelled_at.get_or_insert(now);
            self.finished_at = Some(now);
            return;
        }

        let total = self.outcomes.len();
        let delivered = self.delivered_count();
        let failed = self.failed_count();

        if delivered == total {
            self.advance(JobState::Delivered);
            self.finished_at = Some(now);
        } else if failed == total {
            self.advance(JobState::Failed);
            self.finished_at = Some(now);
        } else if delivered + failed == total {
            self.advance(JobState::PartiallyDelivered);
            self.partial_success = true;
            self.finished_at = Some(now);
        } else if delivered > 0 {
            self.advance(JobState::PartiallyDelivered);
        }
    }

    /// Cancel the job. A leased job is only flagged; its worker finalizes
    /// the cancellation on release.
    pub fn cancel(&mut self, reason: Option<String>, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(JobError::AlreadyTerminal(self.id));
        }

        self.cancellation_reason = reason;
        self.updated_at = now;

        let leased = self
            .lease
            .as_ref()
            .map(|lease| lease.is_active(now))
            .unwrap_or(false);

        if leased {
            self.cancel_requested = true;
        } else {
            self.lease = None;
            self.state = JobState::Cancelled;
            self.cancelled_at = Some(now);
            self.finished_at = Some(now);
        }
        Ok(())
    }
}

/// `at + delta`, saturating at the maximum representable time.
pub(crate) fn add_signed(at: DateTime<Utc>, delta: chrono::Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at + duration` for a std duration.
pub(crate) fn add_std(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(duration) {
        Ok(delta) => add_signed(at, delta),
        Err(_) => DateTime::<Utc>::MAX_UTC,
    }
}

mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn job(destinations: &[&str]) -> JobRecord {
        JobRecord::publish(
            Payload::new(json!({"text": "hello"})),
            destinations.iter().map(|d| Destination::from(*d)),
            t0(),
            3,
            None,
            t0(),
        )
        .unwrap()
    }

    fn delivered(handle: &str) -> DestinationOutcome {
        DestinationOutcome::Delivered {
            handle: MessageHandle::from(handle),
            delivered_at: t0(),
            attempts: 1,
        }
    }

    fn failed() -> DestinationOutcome {
        DestinationOutcome::PermanentlyFailed {
            reason: FailureReason::Unauthorized,
            attempts: 1,
        }
    }

    #[test]
    fn duplicate_destinations_collapse() {
        let job = job(&["@news", "@news", "-1001"]);
        assert_eq!(job.outcomes.len(), 2);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn empty_destinations_rejected() {
        let err = JobRecord::publish(Payload::default(), Vec::new(), t0(), 3, None, t0())
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidJob(_)));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = JobRecord::publish(
            Payload::default(),
            vec![Destination::from("a")],
            t0(),
            0,
            None,
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::InvalidJob(_)));
    }

    #[test]
    fn lease_is_exclusive_until_expiry() {
        let mut job = job(&["a"]);
        let ttl = chrono::Duration::seconds(30);

        let first = job.acquire_lease("w1", ttl, t0()).unwrap();
        assert_eq!(job.state, JobState::InFlight);
        assert!(matches!(
            job.acquire_lease("w2", ttl, t0()),
            Err(JobError::AlreadyLeased(_))
        ));

        let later = t0() + chrono::Duration::seconds(31);
        let second = job.acquire_lease("w2", ttl, later).unwrap();
        assert_eq!(job.lease.as_ref().unwrap().owner, "w2");
        assert!(matches!(job.check_lease(&first), Err(JobError::LeaseLost(_))));
        assert!(job.check_lease(&second).is_ok());
        assert_eq!(job.dispatch_count, 2);
    }

    #[test]
    fn same_worker_re_lease_gets_a_fresh_token() {
        let mut job = job(&["a"]);
        let ttl = chrono::Duration::seconds(60);

        let stale = job.acquire_lease("w", ttl, t0()).unwrap();
        let fresh = job
            .acquire_lease("w", ttl, t0() + chrono::Duration::seconds(61))
            .unwrap();

        assert_ne!(stale, fresh);
        assert!(matches!(job.check_lease(&stale), Err(JobError::LeaseLost(_))));
        assert_eq!(job.lease_token(), Some(fresh));
    }

    #[test]
    fn released_in_flight_job_is_waiting() {
        let mut job = job(&["a"]);
        assert!(job.is_waiting(t0()));

        job.acquire_lease("w", chrono::Duration::seconds(60), t0())
            .unwrap();
        assert!(!job.is_waiting(t0()));

        job.record_outcome(
            &"a".into(),
            DestinationOutcome::RetryScheduled {
                next_attempt_at: t0() + chrono::Duration::seconds(30),
                attempts: 1,
                last_error: Some("timeout".into()),
            },
            None,
            t0(),
        )
        .unwrap();
        job.settle(t0());

        assert_eq!(job.state, JobState::InFlight);
        assert!(job.is_waiting(t0()));
    }

    #[test]
    fn wake_at_follows_lease_and_retries() {
        let mut job = job(&["a", "b"]);
        assert_eq!(job.wake_at(), Some(t0()));

        job.acquire_lease("w", chrono::Duration::seconds(60), t0())
            .unwrap();
        assert_eq!(job.wake_at(), Some(t0() + chrono::Duration::seconds(60)));

        job.record_outcome(&"a".into(), delivered("1"), None, t0())
            .unwrap();
        job.record_outcome(
            &"b".into(),
            DestinationOutcome::RetryScheduled {
                next_attempt_at: t0() + chrono::Duration::seconds(5),
                attempts: 1,
                last_error: None,
            },
            None,
            t0(),
        )
        .unwrap();
        job.settle(t0());

        assert_eq!(job.state, JobState::PartiallyDelivered);
        assert!(!job.is_terminal());
        assert_eq!(job.wake_at(), Some(t0() + chrono::Duration::seconds(5)));
    }

    #[test]
    fn resolved_outcomes_never_change() {
        let mut job = job(&["a", "b"]);
        job.acquire_lease("w", chrono::Duration::seconds(60), t0())
            .unwrap();
        job.record_outcome(&"a".into(), delivered("1"), None, t0())
            .unwrap();

        let err = job
            .record_outcome(&"a".into(), failed(), None, t0())
            .unwrap_err();
        assert!(matches!(err, JobError::OutcomeRegression { .. }));
        assert!(job.outcome(&"a".into()).unwrap().is_delivered());
    }

    #[test]
    fn settle_aggregates_outcomes() {
        let mut all = job(&["a", "b"]);
        all.record_outcome(&"a".into(), delivered("1"), None, t0())
            .unwrap();
        all.record_outcome(&"b".into(), delivered("2"), None, t0())
            .unwrap();
        all.settle(t0());
        assert_eq!(all.state, JobState::Delivered);

        let mut none = job(&["a", "b"]);
        none.record_outcome(&"a".into(), failed(), None, t0()).unwrap();
        none.record_outcome(&"b".into(), failed(), None, t0()).unwrap();
        none.settle(t0());
        assert_eq!(none.state, JobState::Failed);

        let mut mixed = job(&["a", "b"]);
        mixed
            .record_outcome(&"a".into(), delivered("1"), None, t0())
            .unwrap();
        mixed.record_outcome(&"b".into(), failed(), None, t0()).unwrap();
        mixed.settle(t0());
        assert_eq!(mixed.state, JobState::PartiallyDelivered);
        assert!(mixed.partial_success);
        assert!(mixed.is_terminal());
        assert_eq!(mixed.wake_at(), None);
    }

    #[test]
    fn cancel_of_leased_job_is_deferred() {
        let mut job = job(&["a"]);
        job.acquire_lease("w", chrono::Duration::seconds(60), t0())
            .unwrap();
        job.cancel(Some("user request".into()), t0()).unwrap();
        assert!(job.cancel_requested);
        assert_eq!(job.state, JobState::InFlight);

        job.settle(t0());
        assert_eq!(job.state, JobState::Cancelled);
        assert!(matches!(
            job.cancel(None, t0()),
            Err(JobError::AlreadyTerminal(_))
        ));
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut job = JobRecord::publish(
            Payload::new(json!({"text": "hi", "buttons": [["Open", "https://example.org"]]})),
            vec![Destination::from(-100123_i64)],
            t0(),
            2,
            Some(Duration::from_secs(60)),
            t0(),
        )
        .unwrap()
        .with_owner(Some("42".into()));
        job.outcomes.insert(
            Destination::from(-100123_i64),
            DestinationOutcome::PermanentlyFailed {
                reason: FailureReason::Rejected("MESSAGE_TOO_LONG".into()),
                attempts: 1,
            },
        );

        let text = serde_json::to_string(&job).unwrap();
        let back: JobRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.auto_delete_after(), Some(Duration::from_secs(60)));
    }

    fn outcome_strategy() -> impl Strategy<Value = DestinationOutcome> {
        prop_oneof![
            Just(DestinationOutcome::NotAttempted),
            (1u32..5).prop_map(|attempts| DestinationOutcome::Delivered {
                handle: MessageHandle::from("m"),
                delivered_at: t0(),
                attempts,
            }),
            (1u32..5, 0i64..600).prop_map(|(attempts, secs)| DestinationOutcome::RetryScheduled {
                next_attempt_at: t0() + chrono::Duration::seconds(secs),
                attempts,
                last_error: None,
            }),
            (1u32..5).prop_map(|attempts| DestinationOutcome::PermanentlyFailed {
                reason: FailureReason::RetryExhausted,
                attempts,
            }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// A delivered destination stays delivered whatever is recorded after it,
        /// and the job state rank never decreases.
        #[test]
        fn prop_outcomes_are_monotonic(updates in prop::collection::vec((0usize..3, outcome_strategy()), 1..30)) {
            let names = ["a", "b", "c"];
            let mut job = job(&names);
            job.acquire_lease("w", chrono::Duration::seconds(3600), t0()).unwrap();

            for (idx, outcome) in updates {
                let destination = Destination::from(names[idx]);
                let before = job.outcome(&destination).cloned().unwrap();
                let state_before = job.state;
                let result = job.record_outcome(&destination, outcome.clone(), None, t0());

                if before.is_resolved() {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(job.outcome(&destination).unwrap(), &before);
                } else {
                    prop_assert!(result.is_ok());
                    prop_assert_eq!(job.outcome(&destination).unwrap(), &outcome);
                }
                prop_assert!(job.state.rank() >= state_before.rank());
                prop_assert_eq!(job.outcomes.len(), 3);
            }
        }
    }
}
