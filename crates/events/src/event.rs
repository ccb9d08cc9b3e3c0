use chrono::{DateTime, Utc};

/// A domain-agnostic audit event.
///
/// Events are immutable facts about a committed change. They carry a stable
/// type name (e.g. `"allocation.applied"`) and a schema version.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier.
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the change happened (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
