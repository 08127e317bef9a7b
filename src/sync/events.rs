//! Invalidation event envelopes.
//!
//! Events are transient: published once, delivered synchronously to every
//! current bus listener, never persisted.

use std::fmt;

use time::OffsetDateTime;
use uuid::Uuid;

use super::keys::CacheKey;

/// Monotonic epoch assigned by the bus at publish time.
pub type Epoch = u64;

/// What a listener should do with the targeted keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Mark stale and refetch active subscribers.
    Invalidate,
    /// Same as `Invalidate`, and the change is worth telling the user about.
    DataChanged,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Invalidate => "invalidate",
            EventKind::DataChanged => "data_changed",
        }
    }
}

/// An invalidation published on the bus.
///
/// `targets` holds keys or key prefixes; every cache entry equal to or
/// prefixed by one of them is affected. A mutation on one table usually
/// fans out to several prefixes, which travel together in one event so
/// the user sees a single notification.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    /// Unique identifier, for log correlation.
    pub id: Uuid,
    /// Publish order within this process. Zero until published.
    pub epoch: Epoch,
    pub kind: EventKind,
    pub targets: Vec<CacheKey>,
    /// Whether a user-facing notification should be raised.
    pub notify_user: bool,
    /// Dataset or subsystem the change came from, e.g. a table name.
    pub source_label: String,
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    fn new(
        kind: EventKind,
        targets: Vec<CacheKey>,
        notify_user: bool,
        source_label: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch: 0,
            kind,
            targets,
            notify_user,
            source_label: source_label.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Silent invalidation of a single key or prefix.
    pub fn invalidate(key_or_prefix: CacheKey, source_label: impl Into<String>) -> Self {
        Self::new(
            EventKind::Invalidate,
            vec![key_or_prefix],
            false,
            source_label,
        )
    }

    /// Silent invalidation of several keys or prefixes.
    pub fn invalidate_all(targets: Vec<CacheKey>, source_label: impl Into<String>) -> Self {
        Self::new(EventKind::Invalidate, targets, false, source_label)
    }

    /// Data-changed notification for several keys or prefixes.
    pub fn data_changed(targets: Vec<CacheKey>, source_label: impl Into<String>) -> Self {
        Self::new(EventKind::DataChanged, targets, true, source_label)
    }
}

impl fmt::Display for InvalidationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} from `{}` [",
            self.kind.as_str(),
            self.epoch,
            self.source_label
        )?;
        for (index, target) in self.targets.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{target}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_is_silent() {
        let event = InvalidationEvent::invalidate(CacheKey::root("sewerData"), "poll");
        assert_eq!(event.kind, EventKind::Invalidate);
        assert!(!event.notify_user);
        assert_eq!(event.targets, vec![CacheKey::root("sewerData")]);
        assert!(!event.id.is_nil());
    }

    #[test]
    fn data_changed_notifies() {
        let event = InvalidationEvent::data_changed(
            vec![CacheKey::root("adminSewerData"), CacheKey::root("sewerData")],
            "sewer_quality_data",
        );
        assert_eq!(event.kind, EventKind::DataChanged);
        assert!(event.notify_user);
        assert_eq!(event.targets.len(), 2);
    }

    #[test]
    fn display_lists_targets() {
        let event = InvalidationEvent::invalidate_all(
            vec![CacheKey::root("a"), CacheKey::root("b")],
            "poll:operational",
        );
        assert_eq!(
            event.to_string(),
            r#"invalidate#0 from `poll:operational` [["a"], ["b"]]"#
        );
    }
}
