//! Label state shared by pipeline stages.
//!
//! A `LabelsBuilder` holds the immutable stream labels plus the per-line
//! overlays accumulated while stages run. Finalizing a line produces an
//! immutable, hashed `LabelsResult` which is cached by content hash so that
//! repetitive streams do not recompute identical label sets.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crc::{Crc, CRC_64_XZ};
use tracing::debug;

use super::parsers::ParserHints;

/// Reserved label holding the error kind recorded by a failing stage.
pub const ERROR_LABEL: &str = "__error__";
/// Reserved label holding the human-readable error detail.
pub const ERROR_DETAILS_LABEL: &str = "__error_details__";
/// Suffix applied to extracted labels colliding with a stream label.
pub const EXTRACTED_SUFFIX: &str = "_extracted";

const LABEL_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// A single (name, value) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Provenance of a label within a line's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelCategory {
    Stream,
    StructuredMetadata,
    Parsed,
}

/// An immutable label set, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|a, b| a.name == b.name);
        Self(labels)
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Content hash of the sorted label set.
    pub fn hash(&self) -> u64 {
        let mut digest = LABEL_HASH.digest();
        for label in &self.0 {
            digest.update(label.name.as_bytes());
            digest.update(&[0xfe]);
            digest.update(label.value.as_bytes());
            digest.update(&[0xff]);
        }
        digest.finalize()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// An immutable, hashed snapshot of a fully resolved label set, split by
/// provenance. Once constructed it is cached and never mutated.
#[derive(Debug, PartialEq, Eq)]
pub struct LabelsResult {
    stream: Labels,
    structured_metadata: Labels,
    parsed: Labels,
    combined: Labels,
    hash: u64,
}

impl LabelsResult {
    pub(crate) fn new(stream: Labels, structured_metadata: Labels, parsed: Labels) -> Self {
        let mut all: Vec<Label> = Vec::with_capacity(
            stream.len() + structured_metadata.len() + parsed.len(),
        );
        all.extend(stream.iter().cloned());
        all.extend(structured_metadata.iter().cloned());
        all.extend(parsed.iter().cloned());
        let combined = Labels::new(all);
        let hash = combined.hash();
        Self {
            stream,
            structured_metadata,
            parsed,
            combined,
            hash,
        }
    }

    /// All labels of the line, sorted by name.
    pub fn labels(&self) -> &Labels {
        &self.combined
    }

    pub fn stream(&self) -> &Labels {
        &self.stream
    }

    pub fn structured_metadata(&self) -> &Labels {
        &self.structured_metadata
    }

    pub fn parsed(&self) -> &Labels {
        &self.parsed
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl fmt::Display for LabelsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.combined.fmt(f)
    }
}

/// Cache of finalized results keyed by content hash, shared across all
/// streams of one query execution.
pub(crate) type ResultCache = Arc<RwLock<HashMap<u64, Arc<LabelsResult>>>>;

/// The resolved base state of one stream: its sorted labels, their hash,
/// and the pre-built result returned for lines with no overlays.
#[derive(Debug)]
pub struct BaseLabels {
    labels: Labels,
    hash: u64,
    result: Arc<LabelsResult>,
}

impl BaseLabels {
    pub fn new(labels: Labels) -> Self {
        let hash = labels.hash();
        let result = Arc::new(LabelsResult::new(
            labels.clone(),
            Labels::default(),
            Labels::default(),
        ));
        Self {
            labels,
            hash,
            result,
        }
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Per-stream mutable overlay state over a base label set.
///
/// The builder is owned by exactly one stream pipeline and is `reset`
/// between lines: overlays, deletions, and errors clear while the base
/// labels and the shared result cache survive.
#[derive(Debug)]
pub struct LabelsBuilder {
    base: Arc<BaseLabels>,
    add: [Vec<Label>; 3],
    deleted: Vec<String>,
    err: Option<String>,
    err_details: Option<String>,
    cache: ResultCache,
    hints: ParserHints,
}

fn category_index(category: LabelCategory) -> usize {
    match category {
        LabelCategory::Stream => 0,
        LabelCategory::StructuredMetadata => 1,
        LabelCategory::Parsed => 2,
    }
}

impl LabelsBuilder {
    pub fn new(base: Arc<BaseLabels>, cache: ResultCache) -> Self {
        Self {
            base,
            add: [Vec::new(), Vec::new(), Vec::new()],
            deleted: Vec::new(),
            err: None,
            err_details: None,
            cache,
            hints: ParserHints::default(),
        }
    }

    /// Attaches extraction hints threaded through parser stages.
    pub fn with_hints(mut self, hints: ParserHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn base(&self) -> &Labels {
        self.base.labels()
    }

    pub fn parser_hints(&self) -> &ParserHints {
        &self.hints
    }

    /// Returns the builder to the clean state, retaining base labels and
    /// the shared result cache.
    pub fn reset(&mut self) {
        for overlay in &mut self.add {
            overlay.clear();
        }
        self.deleted.clear();
        self.err = None;
        self.err_details = None;
        self.hints.reset_line();
    }

    pub fn is_clean(&self) -> bool {
        self.add.iter().all(Vec::is_empty)
            && self.deleted.is_empty()
            && self.err.is_none()
            && self.err_details.is_none()
    }

    /// Sets a label in the given category, replacing an existing overlay
    /// entry of the same name.
    pub fn set(&mut self, category: LabelCategory, name: &str, value: &str) {
        let overlay = &mut self.add[category_index(category)];
        match overlay.iter_mut().find(|l| l.name == name) {
            Some(label) => value.clone_into(&mut label.value),
            None => overlay.push(Label::new(name, value)),
        }
        self.hints.record_extracted(name);
    }

    /// Adds a parsed label, renaming it when the name collides with a
    /// stream label so the stream label is never shadowed.
    pub fn add_extracted(&mut self, name: &str, value: &str) {
        self.set_suffixed(LabelCategory::Parsed, name, value);
    }

    /// Adds a structured-metadata label under the same collision policy as
    /// parsed labels.
    pub fn add_structured_metadata(&mut self, name: &str, value: &str) {
        self.set_suffixed(LabelCategory::StructuredMetadata, name, value);
    }

    fn set_suffixed(&mut self, category: LabelCategory, name: &str, value: &str) {
        if self.base.labels().has(name) {
            let renamed = format!("{name}{EXTRACTED_SUFFIX}");
            self.set(category, &renamed, value);
        } else {
            self.set(category, name, value);
        }
    }

    /// Deletes a label by name. Deleting the reserved error labels clears
    /// the corresponding builder field instead.
    pub fn del(&mut self, name: &str) {
        if name == ERROR_LABEL {
            self.err = None;
            return;
        }
        if name == ERROR_DETAILS_LABEL {
            self.err_details = None;
            return;
        }
        for overlay in &mut self.add {
            overlay.retain(|l| l.name != name);
        }
        if !self.deleted.iter().any(|d| d == name) {
            self.deleted.push(name.to_string());
        }
    }

    /// Resolves the current value of a label: overlays take precedence
    /// over base labels, deletions hide base labels.
    pub fn get(&self, name: &str) -> Option<&str> {
        if name == ERROR_LABEL {
            return self.err.as_deref();
        }
        if name == ERROR_DETAILS_LABEL {
            return self.err_details.as_deref();
        }
        for overlay in self.add.iter().rev() {
            if let Some(label) = overlay.iter().find(|l| l.name == name) {
                return Some(&label.value);
            }
        }
        if self.deleted.iter().any(|d| d == name) {
            return None;
        }
        self.base.labels().get(name)
    }

    /// Names of all currently visible labels, excluding the reserved
    /// error labels.
    pub fn resolved_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for label in self.base.labels() {
            if !self.deleted.iter().any(|d| *d == label.name) {
                names.push(label.name.clone());
            }
        }
        for overlay in &self.add {
            for label in overlay {
                if !names.iter().any(|n| *n == label.name) {
                    names.push(label.name.clone());
                }
            }
        }
        names
    }

    pub fn set_error(&mut self, kind: &str, details: &str) {
        // First error wins; later stages observe it via the reserved label.
        if self.err.is_none() {
            self.err = Some(kind.to_string());
            self.err_details = Some(details.to_string());
        }
    }

    pub fn has_error(&self) -> bool {
        self.err.is_some()
    }

    /// Finalizes the line's labels. O(1) in the clean state; otherwise the
    /// resolved set is materialized once per distinct content hash.
    pub fn labels_result(&mut self) -> Arc<LabelsResult> {
        if self.is_clean() {
            return Arc::clone(&self.base.result);
        }

        let overridden = |name: &str| {
            self.add
                .iter()
                .any(|overlay| overlay.iter().any(|l| l.name == name))
        };

        let mut stream: Vec<Label> = self
            .base
            .labels()
            .iter()
            .filter(|l| !self.deleted.iter().any(|d| *d == l.name) && !overridden(&l.name))
            .cloned()
            .collect();
        stream.extend(self.add[0].iter().cloned());

        let structured_metadata = self.add[1].clone();

        let mut parsed = self.add[2].clone();
        if let Some(err) = &self.err {
            parsed.push(Label::new(ERROR_LABEL, err.as_str()));
        }
        if let Some(details) = &self.err_details {
            parsed.push(Label::new(ERROR_DETAILS_LABEL, details.as_str()));
        }

        let stream = Labels::new(stream);
        let structured_metadata = Labels::new(structured_metadata);
        let parsed = Labels::new(parsed);

        let mut all: Vec<Label> = Vec::new();
        all.extend(stream.iter().cloned());
        all.extend(structured_metadata.iter().cloned());
        all.extend(parsed.iter().cloned());
        let hash = Labels::new(all).hash();

        if let Some(hit) = self.cache.read().expect("result cache poisoned").get(&hash) {
            return Arc::clone(hit);
        }

        let result = Arc::new(LabelsResult::new(stream, structured_metadata, parsed));
        debug!(hash, labels = %result, "caching new labels result");
        self.cache
            .write()
            .expect("result cache poisoned")
            .insert(hash, Arc::clone(&result));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(base: &[(&str, &str)]) -> LabelsBuilder {
        let base = Arc::new(BaseLabels::new(Labels::from_pairs(base)));
        LabelsBuilder::new(base, ResultCache::default())
    }

    #[test]
    fn test_clean_builder_returns_base_result() {
        let mut b = builder(&[("app", "api"), ("env", "prod")]);
        let first = b.labels_result();
        assert_eq!(first.labels().get("app"), Some("api"));
        assert_eq!(first.parsed().len(), 0);

        // Reset with no intervening mutation returns the same cached object.
        b.reset();
        let second = b.labels_result();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_set_and_del() {
        let mut b = builder(&[("app", "api")]);
        b.set(LabelCategory::Parsed, "level", "warn");
        assert_eq!(b.get("level"), Some("warn"));

        b.del("app");
        assert_eq!(b.get("app"), None);

        let result = b.labels_result();
        assert_eq!(result.stream().len(), 0);
        assert_eq!(result.parsed().get("level"), Some("warn"));
    }

    #[test]
    fn test_collision_gets_suffix() {
        let mut b = builder(&[("env", "extracted")]);
        b.add_extracted("env", "debug");

        let result = b.labels_result();
        assert_eq!(result.stream().get("env"), Some("extracted"));
        assert_eq!(result.parsed().get("env_extracted"), Some("debug"));
    }

    #[test]
    fn test_error_labels_live_in_parsed_partition() {
        let mut b = builder(&[("app", "api")]);
        b.set_error("JSONParserErr", "unexpected end of input");

        let result = b.labels_result();
        assert_eq!(result.parsed().get(ERROR_LABEL), Some("JSONParserErr"));
        assert_eq!(
            result.parsed().get(ERROR_DETAILS_LABEL),
            Some("unexpected end of input")
        );
        assert_eq!(result.stream().get("app"), Some("api"));
    }

    #[test]
    fn test_first_error_wins() {
        let mut b = builder(&[]);
        b.set_error("JSONParserErr", "first");
        b.set_error("LogfmtParserErr", "second");
        assert_eq!(b.get(ERROR_LABEL), Some("JSONParserErr"));
    }

    #[test]
    fn test_deleting_error_label_clears_error() {
        let mut b = builder(&[]);
        b.set_error("JSONParserErr", "oops");
        b.del(ERROR_LABEL);
        b.del(ERROR_DETAILS_LABEL);
        assert!(!b.has_error());
        assert!(b.is_clean());
    }

    #[test]
    fn test_result_cache_shared_across_lines() {
        let mut b = builder(&[("app", "api")]);

        b.set(LabelCategory::Parsed, "level", "warn");
        let first = b.labels_result();

        b.reset();
        b.set(LabelCategory::Parsed, "level", "warn");
        let second = b.labels_result();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_overlay_shadows_base_in_own_category() {
        let mut b = builder(&[("env", "prod")]);
        // An explicit set (label_format style) shadows the base label.
        b.set(LabelCategory::Parsed, "env", "staging");
        let result = b.labels_result();
        assert_eq!(result.stream().get("env"), None);
        assert_eq!(result.parsed().get("env"), Some("staging"));
        assert_eq!(result.labels().get("env"), Some("staging"));
    }

    #[test]
    fn test_labels_display_sorted() {
        let labels = Labels::from_pairs(&[("b", "2"), ("a", "1")]);
        assert_eq!(labels.to_string(), r#"{a="1", b="2"}"#);
    }

    #[test]
    fn test_hash_ignores_insertion_order() {
        let a = Labels::from_pairs(&[("a", "1"), ("b", "2")]);
        let b = Labels::from_pairs(&[("b", "2"), ("a", "1")]);
        assert_eq!(a.hash(), b.hash());
        let c = Labels::from_pairs(&[("a", "1"), ("b", "3")]);
        assert_ne!(a.hash(), c.hash());
    }
}
