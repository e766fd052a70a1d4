//! Topic registry: logical names, canonical broker paths and their handles.
//!
//! A node keeps two registries, one of publish handles and one of subscribe
//! handles. Both map a short logical name (`"porchSwitch"`) to a
//! [`TopicRecord`] whose canonical path is derived once from the topic kind and
//! a caller-supplied fragment:
//!
//! ```text
//! kind "switch" + fragment "house//porch/light"  ──►  /switch/house/porch/light
//! ```

use std::collections::BTreeMap;
use std::fmt;

use super::message_manager::NotifyCallback;

pub const SENSOR: &str = "sensor";
pub const SWITCH: &str = "switch";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic name must not be empty")]
    EmptyName,

    #[error("topic name '{0}' is already registered")]
    Duplicate(String),

    #[error("unknown topic kind '{0}'")]
    UnknownKind(String),

    #[error("topic name '{0}' is unknown")]
    UnknownTopic(String),

    #[error("topic '{0}' has no notify callback")]
    MissingCallback(String),
}

/// Collapses every run of `/` into a single separator.
///
/// Idempotent: a normalized path normalizes to itself.
pub fn normalize_path(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    let mut previous_was_separator = false;
    for c in raw.chars() {
        let is_separator = c == '/';
        if !(is_separator && previous_was_separator) {
            normalized.push(c);
        }
        previous_was_separator = is_separator;
    }
    normalized
}

/// Table of topic kinds and the path prefix each one selects.
///
/// Starts with `sensor` and `switch`; further kinds are added with
/// [`TopicKinds::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicKinds {
    prefixes: BTreeMap<String, String>,
}

impl Default for TopicKinds {
    fn default() -> Self {
        let mut kinds = Self {
            prefixes: BTreeMap::new(),
        };
        kinds.register(SENSOR, "sensor");
        kinds.register(SWITCH, "switch");
        kinds
    }
}

impl TopicKinds {
    /// Adds or replaces a kind, returning the prefix it had before.
    pub fn register(&mut self, kind: impl Into<String>, prefix: impl Into<String>) -> Option<String> {
        self.prefixes.insert(kind.into(), prefix.into())
    }

    pub fn prefix(&self, kind: &str) -> Option<&str> {
        self.prefixes.get(kind).map(String::as_str)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.prefixes.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.prefixes.keys().map(String::as_str)
    }

    /// Builds `/{prefix}/{fragment}` with duplicate separators collapsed.
    pub fn canonical_path(&self, kind: &str, fragment: &str) -> Result<String, TopicError> {
        let prefix = self
            .prefix(kind)
            .ok_or_else(|| TopicError::UnknownKind(kind.to_string()))?;
        Ok(normalize_path(&format!("/{}/{}", prefix, fragment)))
    }
}

/// One registered logical topic.
pub struct TopicRecord<H> {
    name: String,
    path: String,
    kind: String,
    handle: H,
    callback: Option<NotifyCallback>,
}

impl<H: fmt::Debug> fmt::Debug for TopicRecord<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRecord")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl<H> TopicRecord<H> {
    pub fn new(name: &str, path: String, kind: &str, handle: H) -> Self {
        Self {
            name: name.to_string(),
            path,
            kind: kind.to_string(),
            handle,
            callback: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn callback(&self) -> Option<&NotifyCallback> {
        self.callback.as_ref()
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn into_handle(self) -> H {
        self.handle
    }
}

/// Logical name → [`TopicRecord`], iterated in name order.
pub struct TopicRegistry<H> {
    records: BTreeMap<String, TopicRecord<H>>,
}

impl<H> Default for TopicRegistry<H> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<H> TopicRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that `name` could be registered right now.
    pub fn check_available(&self, name: &str) -> Result<(), TopicError> {
        if name.is_empty() {
            return Err(TopicError::EmptyName);
        }
        if self.records.contains_key(name) {
            return Err(TopicError::Duplicate(name.to_string()));
        }
        Ok(())
    }

    /// Inserts `record`; on conflict the registry is left untouched and the
    /// record is dropped together with its handle.
    pub fn insert(&mut self, record: TopicRecord<H>) -> Result<&TopicRecord<H>, TopicError> {
        self.check_available(&record.name)?;
        let name = record.name.clone();
        Ok(self.records.entry(name).or_insert(record))
    }

    pub fn remove(&mut self, name: &str) -> Result<TopicRecord<H>, TopicError> {
        self.records
            .remove(name)
            .ok_or_else(|| TopicError::UnknownTopic(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&TopicRecord<H>> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicRecord<H>> {
        self.records.values()
    }

    /// Sets the callback of `name`, returning the one it replaces.
    pub fn set_callback(
        &mut self,
        name: &str,
        callback: NotifyCallback,
    ) -> Result<Option<NotifyCallback>, TopicError> {
        let record = self
            .records
            .get_mut(name)
            .ok_or_else(|| TopicError::UnknownTopic(name.to_string()))?;
        Ok(record.callback.replace(callback))
    }

    pub fn clear_callback(&mut self, name: &str) -> Result<Option<NotifyCallback>, TopicError> {
        let record = self
            .records
            .get_mut(name)
            .ok_or_else(|| TopicError::UnknownTopic(name.to_string()))?;
        Ok(record.callback.take())
    }

    pub fn callback(&self, name: &str) -> Result<NotifyCallback, TopicError> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| TopicError::UnknownTopic(name.to_string()))?;
        record
            .callback
            .clone()
            .ok_or_else(|| TopicError::MissingCallback(name.to_string()))
    }

    /// Empties the registry, handing every record to the caller.
    pub fn take_all(&mut self) -> Vec<TopicRecord<H>> {
        std::mem::take(&mut self.records).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(name: &str, path: &str) -> TopicRecord<u32> {
        TopicRecord::new(name, path.to_string(), SENSOR, 7)
    }

    #[test]
    fn normalize_collapses_separator_runs() {
        assert_eq!(normalize_path("//switch///bldg//room/light"), "/switch/bldg/room/light");
        assert_eq!(normalize_path("no/dupes"), "no/dupes");
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("////"), "/");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["", "/", "//a", "a//b///c/", "/sensor//x/y//", "plain", "ä//ö"] {
            let once = normalize_path(raw);
            assert_eq!(normalize_path(&once), once, "input {:?}", raw);
            assert!(!once.contains("//"));
        }
    }

    #[test]
    fn canonical_path_uses_kind_prefix() {
        let kinds = TopicKinds::default();
        assert_eq!(
            kinds.canonical_path(SWITCH, "bldg//room/light").unwrap(),
            "/switch/bldg/room/light"
        );
        assert_eq!(
            kinds.canonical_path(SENSOR, "/house/kitchen/temp").unwrap(),
            "/sensor/house/kitchen/temp"
        );
        assert_eq!(
            kinds.canonical_path("relay", "x"),
            Err(TopicError::UnknownKind("relay".to_string()))
        );
    }

    #[test]
    fn kinds_are_extensible() {
        let mut kinds = TopicKinds::default();
        assert!(kinds.register("climate", "hvac").is_none());
        assert_eq!(kinds.canonical_path("climate", "attic").unwrap(), "/hvac/attic");
        assert_eq!(kinds.kinds().collect::<Vec<_>>(), vec!["climate", SENSOR, SWITCH]);
    }

    #[test]
    fn duplicate_insert_keeps_first_record() {
        let mut registry = TopicRegistry::new();
        registry.insert(record("temp", "/sensor/a")).unwrap();
        let err = registry.insert(record("temp", "/sensor/b")).unwrap_err();

        assert_eq!(err, TopicError::Duplicate("temp".to_string()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("temp").unwrap().path(), "/sensor/a");
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut registry = TopicRegistry::new();
        assert_eq!(registry.insert(record("", "/sensor/a")).unwrap_err(), TopicError::EmptyName);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_unknown_leaves_registry_alone() {
        let mut registry = TopicRegistry::new();
        registry.insert(record("temp", "/sensor/a")).unwrap();
        assert!(registry.remove("nope").is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remove("temp").unwrap().into_handle(), 7);
        assert!(registry.is_empty());
    }

    #[test]
    fn callback_is_replaced_not_appended() {
        let mut registry = TopicRegistry::new();
        registry.insert(record("porch", "/switch/porch")).unwrap();

        let first: NotifyCallback = Arc::new(|_: &str, _: &str| true);
        let second: NotifyCallback = Arc::new(|_: &str, _: &str| false);
        assert!(registry.set_callback("porch", first.clone()).unwrap().is_none());
        let replaced = registry.set_callback("porch", second.clone()).unwrap().unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&registry.callback("porch").unwrap(), &second));

        registry.clear_callback("porch").unwrap();
        assert_eq!(
            registry.callback("porch").err(),
            Some(TopicError::MissingCallback("porch".to_string()))
        );
    }

    #[test]
    fn callback_on_unknown_topic_fails() {
        let mut registry: TopicRegistry<u32> = TopicRegistry::new();
        let cb: NotifyCallback = Arc::new(|_: &str, _: &str| true);
        assert!(registry.set_callback("ghost", cb).is_err());
        assert!(registry.clear_callback("ghost").is_err());
        assert_eq!(
            registry.callback("ghost").err(),
            Some(TopicError::UnknownTopic("ghost".to_string()))
        );
    }

    #[test]
    fn take_all_empties_in_name_order() {
        let mut registry = TopicRegistry::new();
        registry.insert(record("b", "/sensor/b")).unwrap();
        registry.insert(record("a", "/sensor/a")).unwrap();
        let names: Vec<String> = registry
            .take_all()
            .into_iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.is_empty());
    }
}
