//! Filter validation, merging and fingerprints

use crate::config::FilterValidationMode;
use crate::error::{ClientError, Result};
use crate::message::Filter;

/// Tag filters whose values must be event ids or pubkeys.
const HEX_TAG_KEYS: [&str; 2] = ["#e", "#p"];

fn is_hex64(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Apply the configured validation policy to a set of filters.
pub fn process_filters(filters: Vec<Filter>, mode: FilterValidationMode) -> Result<Vec<Filter>> {
    match mode {
        FilterValidationMode::Ignore => Ok(filters),
        FilterValidationMode::Validate => {
            let issues = filter_issues(&filters);
            if issues.is_empty() {
                Ok(filters)
            } else {
                Err(ClientError::InvalidFilter(issues))
            }
        }
        FilterValidationMode::Fix => Ok(filters.into_iter().map(fix_filter).collect()),
    }
}

/// Describe every malformed entry, e.g.
/// `Filter[0].ids[1] is not a valid 64-char hex string: "x"`.
pub fn filter_issues(filters: &[Filter]) -> Vec<String> {
    let mut issues = Vec::new();
    for (i, filter) in filters.iter().enumerate() {
        for (field, values) in hex_fields(filter) {
            for (j, value) in values.iter().enumerate() {
                if !is_hex64(value) {
                    issues.push(format!(
                        "Filter[{}].{}[{}] is not a valid 64-char hex string: \"{}\"",
                        i, field, j, value
                    ));
                }
            }
        }
    }
    issues
}

fn hex_fields(filter: &Filter) -> Vec<(&str, &Vec<String>)> {
    let mut fields = Vec::new();
    if let Some(ids) = &filter.ids {
        fields.push(("ids", ids));
    }
    if let Some(authors) = &filter.authors {
        fields.push(("authors", authors));
    }
    for key in HEX_TAG_KEYS {
        if let Some(values) = filter.tags.get(key) {
            fields.push((key, values));
        }
    }
    fields
}

fn fix_filter(mut filter: Filter) -> Filter {
    fn strip(values: Option<Vec<String>>) -> Option<Vec<String>> {
        let kept: Vec<String> = values?.into_iter().filter(|v| is_hex64(v)).collect();
        (!kept.is_empty()).then_some(kept)
    }

    filter.ids = strip(filter.ids.take());
    filter.authors = strip(filter.authors.take());
    for key in HEX_TAG_KEYS {
        if let Some(values) = filter.tags.remove(key)
            && let Some(kept) = strip(Some(values))
        {
            filter.tags.insert(key.to_string(), kept);
        }
    }
    filter
}

impl Filter {
    /// Merge `other` into this filter: list fields are unioned, scalar
    /// fields take the value from `other` when it has one.
    pub fn merge(&mut self, other: &Filter) {
        fn union<T: Clone + PartialEq>(into: &mut Option<Vec<T>>, from: &Option<Vec<T>>) {
            let Some(from) = from else { return };
            let target = into.get_or_insert_with(Vec::new);
            for value in from {
                if !target.contains(value) {
                    target.push(value.clone());
                }
            }
        }

        union(&mut self.ids, &other.ids);
        union(&mut self.authors, &other.authors);
        union(&mut self.kinds, &other.kinds);
        for (key, values) in &other.tags {
            let mut existing = self.tags.remove(key);
            union(&mut existing, &Some(values.clone()));
            if let Some(merged) = existing {
                self.tags.insert(key.clone(), merged);
            }
        }

        if other.since.is_some() {
            self.since = other.since;
        }
        if other.until.is_some() {
            self.until = other.until;
        }
        if other.limit.is_some() {
            self.limit = other.limit;
        }
        if other.search.is_some() {
            self.search.clone_from(&other.search);
        }
    }

    /// Copy of the filter with the named keys removed. Used to widen a
    /// query before sending it to the cache.
    pub fn without_keys(&self, keys: &[String]) -> Filter {
        let mut filter = self.clone();
        for key in keys {
            match key.as_str() {
                "ids" => filter.ids = None,
                "authors" => filter.authors = None,
                "kinds" => filter.kinds = None,
                "since" => filter.since = None,
                "until" => filter.until = None,
                "limit" => filter.limit = None,
                "search" => filter.search = None,
                tag => {
                    filter.tags.remove(tag);
                }
            }
        }
        filter
    }

    /// Names of the keys present in this filter, sorted. `since` and
    /// `until` carry their value since differing time bounds can't share a
    /// request.
    pub fn fingerprint_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if self.ids.is_some() {
            keys.push("ids".to_string());
        }
        if self.authors.is_some() {
            keys.push("authors".to_string());
        }
        if self.kinds.is_some() {
            keys.push("kinds".to_string());
        }
        if let Some(since) = self.since {
            keys.push(format!("since:{}", since));
        }
        if let Some(until) = self.until {
            keys.push(format!("until:{}", until));
        }
        if self.limit.is_some() {
            keys.push("limit".to_string());
        }
        if self.search.is_some() {
            keys.push("search".to_string());
        }
        keys.extend(self.tags.keys().cloned());
        keys.sort();
        keys
    }
}

/// Merge filter lists position by position: the i-th filter of every list
/// is folded into the i-th output filter.
pub fn merge_filter_lists<'a>(lists: impl IntoIterator<Item = &'a [Filter]>) -> Vec<Filter> {
    let mut merged: Vec<Filter> = Vec::new();
    for list in lists {
        for (i, filter) in list.iter().enumerate() {
            match merged.get_mut(i) {
                Some(existing) => existing.merge(filter),
                None => merged.push(filter.clone()),
            }
        }
    }
    merged
}

/// Grouping fingerprint of a filter set. `None` means the filters must not
/// be merged with any other subscription.
pub fn filter_fingerprint(filters: &[Filter], close_on_eose: bool) -> Option<String> {
    if filters.iter().any(|f| f.limit.is_some()) {
        return None;
    }

    let parts: Vec<String> = filters.iter().map(|f| f.fingerprint_keys().join("-")).collect();
    let joined = parts.join("|");
    Some(if close_on_eose { format!("+{}", joined) } else { joined })
}
