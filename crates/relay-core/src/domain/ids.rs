//! Strongly-typed identifiers.
//!
//! Session, client and execution ids share one generic implementation,
//! [`Id<T>`], distinguished at compile time by a zero-sized marker. Locally
//! generated ids are `{prefix}{ulid}`; ids handed out by the service are kept
//! verbatim since the service owns their format.
//!
//! Instance ids are different: they are derived, not random, and encode the
//! session they belong to (see [`InstanceId`]).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::TaskError;

/// Marker trait providing the display prefix for generated ids.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

pub struct Id<T: IdMarker> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// New id from a ULID, rendered with the marker prefix.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self::from_string(format!("{}{}", T::prefix(), ulid))
    }

    /// Wraps an opaque id received from elsewhere.
    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

// Manual impls: derives would put bounds on `T`, which is only a marker.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self::from_string(self.value.clone())
    }
}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl IdMarker for Session {
    fn prefix() -> &'static str {
        "session-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Client {}

impl IdMarker for Client {
    fn prefix() -> &'static str {
        "client-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Execution {}

impl IdMarker for Execution {
    fn prefix() -> &'static str {
        "exec-"
    }
}

/// Identifier of a Session (scope grouping task instances).
pub type SessionId = Id<Session>;

/// Identifier of a client process talking to the service.
pub type ClientId = Id<Client>;

/// Identifier of one server-side execution attempt of an instance.
pub type ExecutionId = Id<Execution>;

/// Identifier of a task instance: `{session_id}:{task_name}:{counter}`.
///
/// Deterministic for a given session, task and counter, so registering the
/// same instance twice is idempotent, and the owning session can be read
/// back from the id itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn compose(session_id: &str, task_name: &str, counter: u64) -> Self {
        Self(format!("{session_id}:{task_name}:{counter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Session part of a composed id. `None` for ids not in composed form.
    pub fn session_part(&self) -> Option<&str> {
        self.split().map(|(session, _, _)| session)
    }

    pub fn task_part(&self) -> Option<&str> {
        self.split().map(|(_, task, _)| task)
    }

    fn split(&self) -> Option<(&str, &str, u64)> {
        // session id には `:` が含まれうるので右から切る
        let (rest, counter) = self.0.rsplit_once(':')?;
        let (session, task) = rest.rsplit_once(':')?;
        if session.is_empty() || task.is_empty() {
            return None;
        }
        let counter = counter.parse().ok()?;
        Some((session, task, counter))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(TaskError::Configuration("empty instance id".into()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let session = SessionId::from_ulid(Ulid::new());
        let client = ClientId::from_ulid(Ulid::new());
        let execution = ExecutionId::from_ulid(Ulid::new());

        assert!(session.to_string().starts_with("session-"));
        assert!(client.to_string().starts_with("client-"));
        assert!(execution.to_string().starts_with("exec-"));

        // let _: SessionId = client; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ExecutionId::from_string("exec-42");
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"exec-42\"");
        let back: ExecutionId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn instance_id_carries_its_session() {
        let id = InstanceId::compose("session-abc", "add", 1700000000123);
        assert_eq!(id.as_str(), "session-abc:add:1700000000123");
        assert_eq!(id.session_part(), Some("session-abc"));
        assert_eq!(id.task_part(), Some("add"));
    }

    #[test]
    fn session_ids_may_contain_colons() {
        let id = InstanceId::compose("org:42:session", "add", 7);
        assert_eq!(id.session_part(), Some("org:42:session"));
        assert_eq!(id.task_part(), Some("add"));
    }

    #[test]
    fn foreign_instance_ids_have_no_session() {
        let id: InstanceId = "inst-7".parse().unwrap();
        assert_eq!(id.session_part(), None);
        assert!("  ".parse::<InstanceId>().is_err());
    }

    #[test]
    fn phantom_marker_is_free() {
        use std::mem::size_of;
        assert_eq!(size_of::<SessionId>(), size_of::<String>());
    }
}
