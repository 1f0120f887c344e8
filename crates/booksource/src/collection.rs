// ABOUTME: In-memory collection of book sources and subscriptions with update-in-place import semantics.
// ABOUTME: Implements JSON import/export, audio-only filtering and sync-delete for subscription refreshes.

//! Source collections.
//!
//! A [`SourceCollection`] owns the sources a host has imported plus the
//! [`Subscription`]s they came from. Sources are keyed by `id`: importing a
//! source whose id is already present replaces it in place. Persistence is
//! the host's concern; the collection itself is `Serialize`/`Deserialize`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::source::{normalize_source, Source};

/// A remote URL serving a list of book sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub url: String,
    pub name: String,
    pub added_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub source_count: usize,
}

impl Subscription {
    /// A new, never-refreshed subscription.
    pub fn new(id: impl Into<String>, url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: name.into(),
            added_at: Utc::now(),
            last_updated: None,
            enabled: true,
            source_count: 0,
        }
    }
}

/// Counts produced by one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Distinct source ids present in the imported list.
    pub total: usize,
}

/// Keep only Legado audio sources (`bookSourceType == 1`).
///
/// The filter applies only when the list carries `bookSourceType` at all and
/// at least one entry is an audio source; otherwise the list is returned as is.
pub fn audio_only(list: Vec<Value>) -> Vec<Value> {
    let is_audio = |v: &Value| v.get("bookSourceType").and_then(Value::as_i64) == Some(1);
    let typed = list.iter().any(|v| v.get("bookSourceType").is_some());
    let audio_count = list.iter().filter(|v| is_audio(v)).count();
    if typed && audio_count > 0 {
        debug!(audio = audio_count, total = list.len(), "filtering audio sources");
        list.into_iter().filter(is_audio).collect()
    } else {
        list
    }
}

/// Turn a JSON payload into a list of raw source objects: arrays as is, anything else as one entry.
pub fn source_list(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Sources and subscriptions owned by a host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCollection {
    #[serde(default)]
    sources: Vec<Source>,
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

impl SourceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Enabled sources, in insertion order.
    pub fn enabled(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Insert `source`, replacing any source with the same id in place.
    ///
    /// Returns `true` when an existing entry was updated.
    pub fn upsert(&mut self, source: Source) -> bool {
        match self.sources.iter_mut().find(|s| s.id == source.id) {
            Some(existing) => {
                *existing = source;
                true
            }
            None => {
                self.sources.push(source);
                false
            }
        }
    }

    /// Add a new source; a source with the same id is an error.
    pub fn add(&mut self, source: Source) -> Result<(), SourceError> {
        if self.get(&source.id).is_some() {
            return Err(SourceError::invalid_config(
                &source.id,
                "AddSource",
                Some(anyhow::anyhow!("source already exists")),
            ));
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Source> {
        let pos = self.sources.iter().position(|s| s.id == id)?;
        Some(self.sources.remove(pos))
    }

    /// Flip a source's enabled flag, returning the new state.
    pub fn toggle(&mut self, id: &str) -> Option<bool> {
        let source = self.sources.iter_mut().find(|s| s.id == id)?;
        source.enabled = !source.enabled;
        Some(source.enabled)
    }

    /// Import sources from JSON text holding one object or an array.
    ///
    /// Entries that fail to normalize, or whose id or name is already present,
    /// are skipped. Returns the number of sources added.
    pub fn import_json(&mut self, text: &str) -> Result<usize, SourceError> {
        let payload: Value = serde_json::from_str(text.trim_start_matches('\u{feff}').trim())
            .map_err(|e| {
                SourceError::invalid_config("", "ImportJson", Some(anyhow::anyhow!("invalid JSON: {}", e)))
            })?;

        let mut imported = 0;
        for raw in source_list(payload) {
            let Some(source) = normalize_source(&raw, None) else {
                continue;
            };
            if self
                .sources
                .iter()
                .any(|s| s.id == source.id || s.name == source.name)
            {
                debug!(source = %source.label(), "skipping already imported source");
                continue;
            }
            self.sources.push(source);
            imported += 1;
        }
        Ok(imported)
    }

    /// Serialize all sources, or only those with the given ids, as pretty JSON.
    pub fn export_json(&self, ids: Option<&[&str]>) -> Result<String, SourceError> {
        let selected: Vec<&Source> = match ids {
            Some(ids) => self
                .sources
                .iter()
                .filter(|s| ids.contains(&s.id.as_str()))
                .collect(),
            None => self.sources.iter().collect(),
        };
        serde_json::to_string_pretty(&selected).map_err(|e| {
            SourceError::invalid_config("", "ExportJson", Some(anyhow::Error::new(e)))
        })
    }

    pub fn sources_for_subscription(&self, subscription_id: &str) -> Vec<&Source> {
        self.sources
            .iter()
            .filter(|s| s.subscription_id.as_deref() == Some(subscription_id))
            .collect()
    }

    /// Import a fetched list of raw sources on behalf of a subscription.
    ///
    /// Existing ids are updated in place. With `sync_delete`, sources of
    /// `subscription_id` that are absent from `list` are removed. A non-empty
    /// list that yields no valid source is an error.
    pub fn import_list(
        &mut self,
        list: Vec<Value>,
        subscription_id: Option<&str>,
        sync_delete: bool,
    ) -> Result<ImportSummary, SourceError> {
        let sources: Vec<Source> = list
            .iter()
            .filter_map(|raw| {
                let source = normalize_source(raw, subscription_id);
                if source.is_none() {
                    warn!(subscription = subscription_id.unwrap_or(""), "skipping source without a name");
                }
                source
            })
            .collect();

        // Nothing is touched unless the list yielded something usable.
        if sources.is_empty() && !list.is_empty() {
            return Err(SourceError::invalid_config(
                subscription_id.unwrap_or(""),
                "ImportSources",
                Some(anyhow::anyhow!("no valid sources found")),
            ));
        }

        let mut summary = ImportSummary::default();
        let mut seen: Vec<String> = Vec::new();
        for source in sources {
            if !seen.contains(&source.id) {
                seen.push(source.id.clone());
            }
            if self.upsert(source) {
                summary.updated += 1;
            } else {
                summary.imported += 1;
            }
        }

        if let (true, Some(sub)) = (sync_delete, subscription_id) {
            let before = self.sources.len();
            self.sources.retain(|s| {
                s.subscription_id.as_deref() != Some(sub) || seen.contains(&s.id)
            });
            summary.deleted = before - self.sources.len();
        }

        summary.total = seen.len();
        info!(
            subscription = subscription_id.unwrap_or(""),
            imported = summary.imported,
            updated = summary.updated,
            deleted = summary.deleted,
            "imported sources"
        );
        Ok(summary)
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn subscription(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    pub fn subscription_by_url(&self, url: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.url == url)
    }

    pub(crate) fn subscription_mut(&mut self, id: &str) -> Option<&mut Subscription> {
        self.subscriptions.iter_mut().find(|s| s.id == id)
    }

    /// A subscription id not yet used in this collection.
    pub(crate) fn next_subscription_id(&self) -> String {
        let base = format!("sub-{}", Utc::now().timestamp_millis());
        let mut id = base.clone();
        let mut n = 1;
        while self.subscription(&id).is_some() {
            id = format!("{}-{}", base, n);
            n += 1;
        }
        id
    }

    pub(crate) fn insert_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Remove a subscription. Its sources are deleted, or detached when `keep_sources` is set.
    pub fn remove_subscription(&mut self, id: &str, keep_sources: bool) -> Option<Subscription> {
        let pos = self.subscriptions.iter().position(|s| s.id == id)?;
        let removed = self.subscriptions.remove(pos);
        if keep_sources {
            for source in &mut self.sources {
                if source.subscription_id.as_deref() == Some(id) {
                    source.subscription_id = None;
                }
            }
        } else {
            self.sources.retain(|s| s.subscription_id.as_deref() != Some(id));
        }
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn source(id: &str, name: &str) -> Source {
        normalize_source(&json!({"id": id, "name": name}), None).unwrap()
    }

    #[test]
    fn upsert_updates_in_place() {
        let mut c = SourceCollection::new();
        assert!(!c.upsert(source("a", "A")));
        assert!(!c.upsert(source("b", "B")));
        assert!(c.upsert(source("a", "A2")));
        assert_eq!(c.len(), 2);
        assert_eq!(c.sources()[0].name, "A2");
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut c = SourceCollection::new();
        c.add(source("a", "A")).unwrap();
        let err = c.add(source("a", "A")).unwrap_err();
        assert!(err.is_invalid_config());
    }

    #[test]
    fn toggle_and_remove() {
        let mut c = SourceCollection::new();
        c.add(source("a", "A")).unwrap();
        assert_eq!(c.toggle("a"), Some(false));
        assert_eq!(c.enabled().count(), 0);
        assert_eq!(c.toggle("a"), Some(true));
        assert_eq!(c.toggle("missing"), None);
        assert!(c.remove("a").is_some());
        assert!(c.is_empty());
    }

    #[test]
    fn import_json_skips_known_ids_and_names() {
        let mut c = SourceCollection::new();
        let text = r#"[{"name": "A", "baseUrl": "http://a"}, {"name": "B"}, {"nope": 1}]"#;
        assert_eq!(c.import_json(text).unwrap(), 2);
        assert_eq!(c.import_json(text).unwrap(), 0);
        assert_eq!(c.import_json(r#"{"name": "A", "baseUrl": "http://other"}"#).unwrap(), 0);
        assert!(c.import_json("not json").unwrap_err().is_invalid_config());
    }

    #[test]
    fn export_all_or_selected() {
        let mut c = SourceCollection::new();
        c.add(source("a", "A")).unwrap();
        c.add(source("b", "B")).unwrap();
        let all: Vec<Value> = serde_json::from_str(&c.export_json(None).unwrap()).unwrap();
        assert_eq!(all.len(), 2);
        let some: Vec<Value> = serde_json::from_str(&c.export_json(Some(&["b"])).unwrap()).unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0]["name"], "B");
    }

    #[test]
    fn audio_filter_applies_only_to_typed_lists() {
        let typed = vec![
            json!({"name": "text", "bookSourceType": 0}),
            json!({"name": "audio", "bookSourceType": 1}),
        ];
        let filtered = audio_only(typed);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["name"], "audio");

        let no_audio = vec![json!({"name": "text", "bookSourceType": 0})];
        assert_eq!(audio_only(no_audio).len(), 1);

        let untyped = vec![json!({"name": "a"}), json!({"name": "b"})];
        assert_eq!(audio_only(untyped).len(), 2);
    }

    #[test]
    fn import_list_with_sync_delete() {
        let mut c = SourceCollection::new();
        let first = vec![json!({"id": "1", "name": "One"}), json!({"id": "2", "name": "Two"})];
        let summary = c.import_list(first, Some("sub-1"), false).unwrap();
        assert_eq!(summary, ImportSummary { imported: 2, updated: 0, deleted: 0, total: 2 });
        c.add(source("local", "Local")).unwrap();

        let second = vec![json!({"id": "2", "name": "Two v2"}), json!({"id": "3", "name": "Three"})];
        let summary = c.import_list(second, Some("sub-1"), true).unwrap();
        assert_eq!(summary, ImportSummary { imported: 1, updated: 1, deleted: 1, total: 2 });
        assert!(c.get("1").is_none());
        assert!(c.get("local").is_some());
        assert_eq!(c.get("2").unwrap().name, "Two v2");
        assert_eq!(c.sources_for_subscription("sub-1").len(), 2);
    }

    #[test]
    fn import_list_with_no_valid_sources_fails() {
        let mut c = SourceCollection::new();
        let err = c.import_list(vec![json!({"nope": 1})], Some("s"), false).unwrap_err();
        assert!(err.is_invalid_config());
        assert_eq!(c.import_list(vec![], Some("s"), false).unwrap(), ImportSummary::default());
    }

    #[test]
    fn failed_sync_import_leaves_collection_unchanged() {
        let mut c = SourceCollection::new();
        let first = vec![json!({"id": "1", "name": "One"}), json!({"id": "2", "name": "Two"})];
        c.import_list(first, Some("sub"), false).unwrap();
        let before = c.clone();

        let err = c.import_list(vec![json!({"broken": true})], Some("sub"), true).unwrap_err();
        assert!(err.is_invalid_config());
        assert_eq!(c, before);
        assert_eq!(c.sources_for_subscription("sub").len(), 2);
    }

    #[test]
    fn remove_subscription_deletes_or_detaches() {
        let mut c = SourceCollection::new();
        c.insert_subscription(Subscription::new("s1", "http://x/1.json", "one"));
        c.insert_subscription(Subscription::new("s2", "http://x/2.json", "two"));
        c.import_list(vec![json!({"id": "a", "name": "A"})], Some("s1"), false).unwrap();
        c.import_list(vec![json!({"id": "b", "name": "B"})], Some("s2"), false).unwrap();

        c.remove_subscription("s1", false).unwrap();
        assert!(c.get("a").is_none());

        c.remove_subscription("s2", true).unwrap();
        assert_eq!(c.get("b").unwrap().subscription_id, None);
        assert!(c.subscriptions().is_empty());
        assert!(c.remove_subscription("s2", true).is_none());
    }

    #[test]
    fn subscription_ids_are_unique() {
        let mut c = SourceCollection::new();
        let id = c.next_subscription_id();
        c.insert_subscription(Subscription::new(id.clone(), "u", "n"));
        assert_ne!(c.next_subscription_id(), id);
    }
}
