//! Adapter Layer to host systems (spec §6 External Interfaces).
//!
//! Thin traits at the seam between the core and whatever surrounds it:
//! source adapters feeding the Ingestion Manager, and read-only
//! collaborators workers consult mid-batch. Each is a small
//! `#[async_trait]` interface with no default methods, so every
//! implementation is explicit about what it does at each call.
//!
//! Concrete transports (HTTP clients, database drivers, message queues) are
//! external collaborators implementing these traits; none of that lives
//! here.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ArtifactRef, CostEstimate, Item, RegimeEvent, Rule, RuleSummary, SchemaSpec};

/// A pluggable data source the Ingestion Manager drives (spec §4.6, §6).
///
/// Implementations must be idempotent at the `item_id` level: replaying the
/// same `(window, params)` must not create duplicate items, since `item_id`
/// is derived purely from content (see [`crate::content_hash`]).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable identifier for this adapter, used for rate limiting, poll
    /// frequency caps, and metric tags.
    fn id(&self) -> &str;

    /// The shape of items this adapter produces, validated against before
    /// storage.
    fn describe_schema(&self) -> SchemaSpec;

    /// Fetch items newly available in `window`, given adapter-specific
    /// `params`. May perform network I/O.
    async fn fetch(&self, window: (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>), params: &serde_json::Value) -> Result<Vec<Item>>;

    /// A-priori cost estimate for a prospective `fetch` call, consulted by
    /// the Cost Controller before it runs.
    async fn estimated_cost(&self, window: (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>), params: &serde_json::Value) -> Result<CostEstimate>;
}

/// Read-only access to the rules workers enumerate while processing a
/// batch (spec §6). The repository backing this lives in host-system code;
/// the core never writes through it.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn get_rule(&self, id: &str) -> Result<Rule>;
    async fn list_active(&self) -> Result<Vec<RuleSummary>>;
}

/// Publishes detected regime changes to external consumers, at-least-once
/// (spec §6).
#[async_trait]
pub trait RegimeEventSink: Send + Sync {
    async fn publish(&self, event: RegimeEvent) -> Result<()>;
}

/// Optional integration point for persisting trained parameters or
/// snapshots outside the Store (spec §6). Unlike `SourceAdapter` and
/// `RuleRepository`, a deployment with no model registry simply never
/// constructs one of these.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn register_artifact(&self, run_id: &str, name: &str, bytes: Vec<u8>, metadata: serde_json::Value) -> Result<ArtifactRef>;
    async fn get_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory `RegimeEventSink` used elsewhere in tests as a cheap
    /// stand-in for a real publish target.
    #[derive(Default)]
    pub struct RecordingRegimeEventSink {
        pub published: Mutex<Vec<RegimeEvent>>,
    }

    #[async_trait]
    impl RegimeEventSink for RecordingRegimeEventSink {
        async fn publish(&self, event: RegimeEvent) -> Result<()> {
            self.published.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn recording_sink_accumulates_published_events() {
        let sink = RecordingRegimeEventSink::default();
        let event = RegimeEvent {
            event_id: "evt-1".to_string(),
            detected_at: chrono::Utc::now(),
            signals: std::collections::HashMap::new(),
            kind: "ks_test".to_string(),
            reference_window: (chrono::Utc::now(), chrono::Utc::now()),
            current_window: (chrono::Utc::now(), chrono::Utc::now()),
        };
        sink.publish(event).await.unwrap();
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }
}
