//! Compiled query pipelines and their per-stream specialization.
//!
//! A `Pipeline` holds the ordered stages compiled from a parsed query
//! plus the caches shared across every stream of one query execution.
//! `for_stream` binds a clone of the stages to an owned labels builder,
//! so per-stream scratch state is never shared between streams; the
//! caches behind the read-write locks are the only cross-stream state.

pub mod extract;
pub mod format;
pub mod label_filter;
pub mod labels;
pub mod line_filter;
pub mod parsers;
pub mod regex;
pub mod stage;

pub use extract::{ExtractError, SampleExtractor, StreamSampleExtractor};
pub use labels::{Label, LabelCategory, Labels, LabelsBuilder, LabelsResult};
pub use stage::{CompileError, Stage};

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::metrics;
use crate::query::ast::LogExpr;

use labels::{BaseLabels, ResultCache};
use parsers::ParserHints;
use stage::compile_stages;

/// Caches shared by all streams of one query execution: resolved stream
/// bases keyed by stream-label hash, and finalized label results keyed by
/// content hash.
#[derive(Debug, Default)]
pub(crate) struct StreamCache {
    bases: RwLock<HashMap<u64, Arc<BaseLabels>>>,
    results: ResultCache,
}

impl StreamCache {
    /// Resolves the base state for a stream. The common path takes the
    /// shared lock; the first sight of a stream takes the exclusive lock.
    fn base_for(&self, labels: Labels) -> Arc<BaseLabels> {
        let hash = labels.hash();
        if let Some(hit) = self.bases.read().expect("stream cache poisoned").get(&hash) {
            return Arc::clone(hit);
        }
        let base = Arc::new(BaseLabels::new(labels));
        debug!(hash, "specializing pipeline for new stream");
        Arc::clone(
            self.bases
                .write()
                .expect("stream cache poisoned")
                .entry(hash)
                .or_insert(base),
        )
    }

    fn builder(&self, labels: Labels, hints: &ParserHints) -> LabelsBuilder {
        LabelsBuilder::new(self.base_for(labels), Arc::clone(&self.results))
            .with_hints(hints.clone())
    }
}

/// The compiled form of a log query.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
    cache: StreamCache,
}

impl Pipeline {
    pub fn compile(expr: &LogExpr) -> Result<Self, CompileError> {
        Ok(Self {
            stages: compile_stages(expr.stages())?,
            cache: StreamCache::default(),
        })
    }

    /// Specializes the pipeline for one log stream. The returned value
    /// owns its label state and must not be shared across streams.
    pub fn for_stream(&self, labels: Labels) -> StreamPipeline {
        StreamPipeline {
            stages: self.stages.clone(),
            builder: self.cache.builder(labels, &ParserHints::default()),
        }
    }
}

/// A pipeline bound to one stream's labels builder.
#[derive(Debug)]
pub struct StreamPipeline {
    stages: Vec<Stage>,
    builder: LabelsBuilder,
}

impl StreamPipeline {
    /// Runs every stage over one line.
    ///
    /// The returned line may borrow the input or own a rewritten buffer;
    /// callers that retain it past the next `process` call must copy it.
    pub fn process<'a>(
        &mut self,
        ts: i64,
        line: &'a str,
        structured_metadata: &[Label],
    ) -> (Cow<'a, str>, Arc<LabelsResult>, bool) {
        self.builder.reset();
        for label in structured_metadata {
            self.builder.add_structured_metadata(&label.name, &label.value);
        }
        let mut current = Cow::Borrowed(line);
        for stage in &mut self.stages {
            let (next, keep) = stage.process(ts, current, &mut self.builder);
            if !keep {
                metrics::record_line_processed(false);
                return (next, self.builder.labels_result(), false);
            }
            current = next;
        }
        metrics::record_line_processed(true);
        (current, self.builder.labels_result(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_expr;
    use crate::query::ast::Expr;

    fn pipeline(query: &str) -> Pipeline {
        let expr = match parse_expr(query).unwrap() {
            Expr::Log(log) => log,
            other => panic!("expected log query, got {other}"),
        };
        Pipeline::compile(&expr).unwrap()
    }

    #[test]
    fn test_filter_parse_format_scenario() {
        let pipeline = pipeline(r#"{app="x"} |= "err" | json | line_format "{{.msg}}""#);
        let mut stream = pipeline.for_stream(Labels::from_pairs(&[("app", "x")]));

        let (line, labels, keep) = stream.process(
            1,
            r#"{"msg":"error: disk full","level":"err"}"#,
            &[],
        );
        assert!(keep);
        assert_eq!(line.as_ref(), "error: disk full");
        assert_eq!(labels.labels().get("level"), Some("err"));
        assert_eq!(labels.labels().get("app"), Some("x"));

        let (_, _, keep) = stream.process(2, r#"{"msg":"all fine","level":"info"}"#, &[]);
        assert!(!keep);
    }

    #[test]
    fn test_or_chain_scenario() {
        let pipeline = pipeline(r#"{app="x"} |= "foo" or "bar""#);
        let mut stream = pipeline.for_stream(Labels::from_pairs(&[("app", "x")]));
        let (_, _, keep) = stream.process(1, "only bar here", &[]);
        assert!(keep);
        let (_, _, keep) = stream.process(2, "neither", &[]);
        assert!(!keep);
    }

    #[test]
    fn test_structured_metadata_joins_result() {
        let pipeline = pipeline(r#"{app="x"}"#);
        let mut stream = pipeline.for_stream(Labels::from_pairs(&[("app", "x")]));
        let (_, labels, keep) = stream.process(
            1,
            "hello",
            &[Label::new("trace_id", "abc123"), Label::new("app", "shadowed")],
        );
        assert!(keep);
        assert_eq!(labels.structured_metadata().get("trace_id"), Some("abc123"));
        // Stream labels are never silently shadowed.
        assert_eq!(labels.stream().get("app"), Some("x"));
        assert_eq!(
            labels.structured_metadata().get("app_extracted"),
            Some("shadowed")
        );
    }

    #[test]
    fn test_label_precedence_scenario() {
        let pipeline = pipeline(r#"{env="extracted"} | json"#);
        let mut stream = pipeline.for_stream(Labels::from_pairs(&[("env", "extracted")]));
        let (_, labels, _) = stream.process(1, r#"{"env":"parsed-value"}"#, &[]);
        assert_eq!(labels.stream().get("env"), Some("extracted"));
        assert_eq!(labels.parsed().get("env_extracted"), Some("parsed-value"));
    }

    #[test]
    fn test_result_cache_shared_across_streams_of_same_labels() {
        let pipeline = pipeline(r#"{app="x"} | json"#);
        let labels = Labels::from_pairs(&[("app", "x")]);

        let mut first = pipeline.for_stream(labels.clone());
        let mut second = pipeline.for_stream(labels);

        let (_, result_a, _) = first.process(1, r#"{"level":"err"}"#, &[]);
        let (_, result_b, _) = second.process(1, r#"{"level":"err"}"#, &[]);
        assert!(Arc::ptr_eq(&result_a, &result_b));
    }

    #[test]
    fn test_error_label_filter_drops_failed_lines() {
        let pipeline = pipeline("{app=\"x\"} | json | __error__=\"\"");
        let mut stream = pipeline.for_stream(Labels::from_pairs(&[("app", "x")]));
        // Malformed JSON records the error label, and the error filter
        // then drops the line.
        let (_, _, keep) = stream.process(1, "not json", &[]);
        assert!(!keep);
        let (_, labels, keep) = stream.process(2, r#"{"level":"err"}"#, &[]);
        assert!(keep);
        assert_eq!(labels.labels().get("level"), Some("err"));
    }

    #[test]
    fn test_label_filter_error_is_line_local() {
        let pipeline = pipeline(r#"{app="x"} | logfmt | duration >= 5.2"#);
        let mut stream = pipeline.for_stream(Labels::from_pairs(&[("app", "x")]));

        // "3s" coerces to seconds: 3 >= 5.2 is false, no error.
        let (_, labels, keep) = stream.process(1, "duration=3s", &[]);
        assert!(!keep);
        assert_eq!(labels.labels().get("__error__"), None);

        // Unparseable values keep the line and mark it as erroring.
        let (_, labels, keep) = stream.process(2, "duration=abc", &[]);
        assert!(keep);
        assert_eq!(labels.labels().get("__error__"), Some("LabelFilterErr"));
    }
}
