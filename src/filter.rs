//! NIP-01 subscription filters.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// Filter sent in `REQ` frames and used to re-check relay output locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Restrict to specific event ids.
    pub ids: Option<Vec<String>>,
    /// Restrict to specific authors.
    pub authors: Option<Vec<String>>,
    /// Restrict to event kinds.
    pub kinds: Option<Vec<u32>>,
    /// Single-letter tag filters keyed without the `#` prefix (e.g. `p`).
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
    /// Upper bound for `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored events requested per relay.
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id.into());
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Add a value for a tag filter; `name` may be given with or without `#`.
    pub fn tag(mut self, name: &str, value: impl Into<String>) -> Self {
        let key = name.trim_start_matches('#').to_string();
        self.tags.entry(key).or_default().push(value.into());
        self
    }

    /// Shorthand for `#p`.
    pub fn pubkey(self, pubkey: impl Into<String>) -> Self {
        self.tag("p", pubkey)
    }

    /// Shorthand for `#e`.
    pub fn event(self, id: impl Into<String>) -> Self {
        self.tag("e", id)
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Convert into the JSON object carried by `REQ`. Empty lists are omitted.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let strings = |v: &[String]| Value::Array(v.iter().cloned().map(Value::String).collect());
        if let Some(ids) = self.ids.as_deref().filter(|v| !v.is_empty()) {
            map.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = self.authors.as_deref().filter(|v| !v.is_empty()) {
            map.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = self.kinds.as_deref().filter(|v| !v.is_empty()) {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(format!("#{tag}"), strings(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        map
    }

    /// Parse a filter object, ignoring fields of the wrong type.
    pub fn from_json(val: &Value) -> Self {
        let string_list = |v: &Value| -> Vec<String> {
            v.as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut filter = Filter {
            ids: val.get("ids").map(string_list),
            authors: val.get("authors").map(string_list),
            kinds: val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_u64().map(|u| u as u32))
                    .collect()
            }),
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
            ..Default::default()
        };
        if let Some(obj) = val.as_object() {
            for (key, value) in obj {
                if let Some(tag) = key.strip_prefix('#') {
                    filter.tags.insert(tag.to_string(), string_list(value));
                }
            }
        }
        filter
    }

    /// Whether `ev` satisfies every condition (`limit` is not considered).
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == ev.id()) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == ev.pubkey()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind()) {
                return false;
            }
        }
        if self.since.is_some_and(|since| ev.created_at() < since) {
            return false;
        }
        if self.until.is_some_and(|until| ev.created_at() > until) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            ev.tag_values(name)
                .any(|v| values.iter().any(|want| want == v))
        })
    }
}
