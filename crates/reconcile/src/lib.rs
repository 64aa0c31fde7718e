//! kdash reconcile: turns pushed change events into cache mutations.
//!
//! [`Reconciler`] is the synchronous rule engine. [`CacheReconciler`] wires one
//! to an [`EventStreamClient`] and keeps any failure inside its own boundary:
//! a bad event is logged and skipped, never propagated to the client or UI.

#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use kdash_cache::{CacheStore, RefetchMode};
use kdash_core::{CacheKey, ChangeEvent, ChangeVerb, ResourceKind, WireMessage};
use kdash_stream::{EventStreamClient, Subscription};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, trace, warn};

mod derived;
mod rules;

pub use rules::{rule_for, Rule};

use rules::{holds_resource, json_type, list_covers, new_entry, remove_entry, upsert_entry, ListEdit, NotAList};

/// Errors raised while applying one event. Each aborts that event only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("{kind} {name}: payload must be an object, got {found}")]
    MalformedPayload { kind: ResourceKind, name: String, found: &'static str },
}

/// Which events a reconciler instance is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Label used in logs, e.g. `deployment-updates`.
    pub family: String,
    /// Kinds handled; `None` handles every kind.
    pub kinds: Option<Vec<ResourceKind>>,
}

impl ReconcilerConfig {
    pub fn all(family: impl Into<String>) -> Self {
        Self { family: family.into(), kinds: None }
    }

    pub fn for_kinds(family: impl Into<String>, kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        Self { family: family.into(), kinds: Some(kinds.into_iter().collect()) }
    }
}

/// Summary of the cache mutations one event caused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub inserted: usize,
    pub merged: usize,
    pub removed: usize,
    pub invalidated: usize,
}

/// Rule engine over a shared cache handle. Holds no resource state of its own.
pub struct Reconciler {
    cache: Arc<dyn CacheStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(cache: Arc<dyn CacheStore>, config: ReconcilerConfig) -> Self {
        Self { cache, config }
    }

    pub fn family(&self) -> &str {
        &self.config.family
    }

    pub fn handles(&self, kind: ResourceKind) -> bool {
        self.config.kinds.as_ref().map(|ks| ks.contains(&kind)).unwrap_or(true)
    }

    /// Decode and apply one wire message. Never panics or returns an error:
    /// failures are logged and the event is dropped.
    pub fn handle(&self, msg: &WireMessage) -> Option<Outcome> {
        let event = match ChangeEvent::try_from(msg) {
            Ok(ev) => ev,
            Err(e) => {
                counter!("reconcile_failures_total", 1u64);
                warn!(family = %self.config.family, error = %e, event_type = %msg.event_type, "reconcile: undecodable event skipped");
                return None;
            }
        };
        if !self.handles(event.kind) {
            trace!(family = %self.config.family, kind = %event.kind, "reconcile: kind outside family");
            return None;
        }
        counter!("reconcile_events_total", 1u64);
        match catch_unwind(AssertUnwindSafe(|| self.apply(&event))) {
            Ok(Ok(outcome)) => {
                debug!(
                    family = %self.config.family, kind = %event.kind, verb = %event.verb,
                    ns = %event.ns().unwrap_or("-"), name = %event.name,
                    inserted = outcome.inserted, merged = outcome.merged,
                    removed = outcome.removed, invalidated = outcome.invalidated,
                    "reconcile: applied"
                );
                Some(outcome)
            }
            Ok(Err(e)) => {
                counter!("reconcile_failures_total", 1u64);
                warn!(family = %self.config.family, error = %e, "reconcile: event skipped");
                None
            }
            Err(_) => {
                counter!("reconcile_failures_total", 1u64);
                error!(family = %self.config.family, kind = %event.kind, name = %event.name, "reconcile: rule panicked; event skipped");
                None
            }
        }
    }

    /// Apply one event: its kind's rule, then derived-view invalidations.
    pub fn apply(&self, event: &ChangeEvent) -> Result<Outcome, RuleError> {
        let patch = payload_of(event)?;
        let mut outcome = Outcome::default();
        match rule_for(event.kind) {
            Rule::Merge => match event.verb {
                ChangeVerb::Added | ChangeVerb::Modified => self.upsert(event, patch, &mut outcome),
                ChangeVerb::Deleted => self.remove(event, &mut outcome),
            },
            Rule::Invalidate => {
                outcome.invalidated += self.cache.invalidate(&|k| holds_resource(k, event), RefetchMode::Active);
            }
        }
        for d in derived::derived_for(event) {
            outcome.invalidated += self.cache.invalidate(&|k| d.matches(k), RefetchMode::Active);
        }
        Ok(outcome)
    }

    /// Added and modified share one path: a duplicate add merges, a modify of
    /// an unknown entry inserts.
    fn upsert(&self, event: &ChangeEvent, patch: Option<&Map<String, Value>>, outcome: &mut Outcome) {
        let lists = self.cache.keys(&|k| matches!(k, CacheKey::List { kind, .. } if *kind == event.kind));
        if lists.is_empty() {
            // Nothing cached for this kind yet: seed the cluster-wide list and
            // mark it stale so the first observer pulls the full list.
            let key = CacheKey::list(event.kind, None);
            self.cache.set(key.clone(), Value::Array(vec![new_entry(event, patch)]));
            self.cache.invalidate(&|k| *k == key, RefetchMode::Active);
            outcome.inserted += 1;
        }
        for key in lists.iter().filter(|k| list_covers(k, event.kind, event.ns())) {
            let mut edit = Ok(ListEdit::Merged { changed: false });
            self.cache.update(key, &mut |list| {
                edit = upsert_entry(list, event, patch);
                !matches!(edit, Ok(ListEdit::Merged { changed: false }) | Err(_))
            });
            match edit {
                Ok(ListEdit::Inserted) => outcome.inserted += 1,
                Ok(ListEdit::Merged { .. }) => outcome.merged += 1,
                Err(NotAList(found)) => warn!(key = %key, found, "reconcile: cached list is not an array; skipped"),
            }
        }
        let detail = CacheKey::detail(event.kind, event.ns(), &event.name);
        let mut merged = false;
        self.cache.update(&detail, &mut |v| match (v.as_object_mut(), patch) {
            (Some(obj), Some(p)) => {
                merged = true;
                rules::merge_fields(obj, p)
            }
            _ => false,
        });
        if merged {
            outcome.merged += 1;
        }
    }

    fn remove(&self, event: &ChangeEvent, outcome: &mut Outcome) {
        let lists = self.cache.keys(&|k| list_covers(k, event.kind, event.ns()));
        for key in &lists {
            let mut removed = Ok(0usize);
            self.cache.update(key, &mut |list| {
                removed = remove_entry(list, event);
                matches!(removed, Ok(n) if n > 0)
            });
            match removed {
                Ok(n) => outcome.removed += n,
                Err(NotAList(found)) => warn!(key = %key, found, "reconcile: cached list is not an array; skipped"),
            }
        }
        let detail = CacheKey::detail(event.kind, event.ns(), &event.name);
        outcome.invalidated += self.cache.invalidate(&|k| *k == detail, RefetchMode::Active);
    }
}

/// Validate the payload before any mutation so a bad event leaves the cache untouched.
fn payload_of(event: &ChangeEvent) -> Result<Option<&Map<String, Value>>, RuleError> {
    match &event.data {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(RuleError::MalformedPayload {
            kind: event.kind,
            name: event.name.clone(),
            found: json_type(other),
        }),
    }
}

/// A [`Reconciler`] subscribed to one event-stream client.
///
/// Subscribes once on [`attach`](Self::attach) and unsubscribes on
/// [`dispose`](Self::dispose) or drop.
pub struct CacheReconciler {
    engine: Arc<Reconciler>,
    subscription: Option<Subscription>,
}

impl CacheReconciler {
    pub fn attach(client: &EventStreamClient, cache: Arc<dyn CacheStore>, config: ReconcilerConfig) -> Self {
        let engine = Arc::new(Reconciler::new(cache, config));
        let handler = Arc::clone(&engine);
        let subscription = client.subscribe(move |msg| {
            handler.handle(msg);
            Ok(())
        });
        info!(family = %engine.family(), client_id = %client.id(), "reconcile: attached");
        Self { engine, subscription: Some(subscription) }
    }

    pub fn family(&self) -> &str {
        self.engine.family()
    }

    pub fn engine(&self) -> &Reconciler {
        &self.engine
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.as_ref().map(Subscription::is_active).unwrap_or(false)
    }

    /// Stop receiving events. Idempotent.
    pub fn dispose(&mut self) {
        if let Some(mut sub) = self.subscription.take() {
            sub.unsubscribe();
            info!(family = %self.engine.family(), "reconcile: detached");
        }
    }
}

impl Drop for CacheReconciler {
    fn drop(&mut self) {
        self.dispose();
    }
}
