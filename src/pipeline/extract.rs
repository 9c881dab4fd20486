//! Sample extraction for metric queries.
//!
//! A sample extractor runs the same stage machinery as a log pipeline and
//! then derives one numeric value per surviving line: a fixed function of
//! the line (count, bytes) or the converted value of an unwrapped label.

use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error;

use crate::query::ast::{
    Grouping, MetricExpr, RangeAggExpr, RangeOp, UnwrapConversion, VectorAggExpr, VectorOp,
};
use crate::query::lexer::{parse_bytes, parse_duration};

use super::label_filter::LabelFilter;
use super::labels::{
    Label, Labels, LabelsBuilder, LabelsResult, ResultCache, ERROR_DETAILS_LABEL, ERROR_LABEL,
};
use super::parsers::ParserHints;
use super::stage::{compile_stages, CompileError, Stage};
use super::StreamCache;

/// Error kind recorded when an unwrapped label fails conversion.
pub const SAMPLE_EXTRACTION_ERROR: &str = "SampleExtractionErr";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("sample extraction requires exactly one range aggregation, found {0}")]
    RangeCount(usize),
}

/// Fixed line-to-value functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSampleKind {
    /// Every surviving line counts 1.
    Count,
    /// The (possibly rewritten) line length in bytes.
    Bytes,
}

#[derive(Debug, Clone)]
enum CompiledKind {
    Line(LineSampleKind),
    Label {
        name: String,
        conversion: Option<UnwrapConversion>,
        post_filters: Vec<LabelFilter>,
    },
}

/// The compiled extraction form of a metric query.
#[derive(Debug)]
pub struct SampleExtractor {
    stages: Vec<Stage>,
    kind: CompiledKind,
    grouping: Option<Grouping>,
    preserve_error: bool,
    hints: ParserHints,
    cache: StreamCache,
}

impl SampleExtractor {
    pub fn compile(expr: &MetricExpr) -> Result<Self, ExtractError> {
        let mut found: Vec<(&RangeAggExpr, Option<&VectorAggExpr>)> = Vec::new();
        collect_ranges(expr, None, &mut found);
        if found.len() != 1 {
            return Err(ExtractError::RangeCount(found.len()));
        }
        let (range_agg, parent) = found[0];

        let stages = compile_stages(range_agg.range.selector.stages())?;

        let kind = match &range_agg.range.unwrap {
            Some(unwrap) => {
                let mut post_filters = Vec::with_capacity(unwrap.post_filters.len());
                for filter in &unwrap.post_filters {
                    post_filters.push(LabelFilter::compile(filter).map_err(CompileError::from)?);
                }
                CompiledKind::Label {
                    name: unwrap.identifier.clone(),
                    conversion: unwrap.conversion,
                    post_filters,
                }
            }
            None => match range_agg.op {
                RangeOp::BytesOverTime | RangeOp::BytesRate => {
                    CompiledKind::Line(LineSampleKind::Bytes)
                }
                _ => CompiledKind::Line(LineSampleKind::Count),
            },
        };

        let grouping = effective_grouping(range_agg, parent);
        let hints = build_hints(&grouping, &kind, &stages);

        Ok(Self {
            stages,
            kind,
            grouping,
            preserve_error: false,
            hints,
            cache: StreamCache::default(),
        })
    }

    /// Retains the error detail label even when grouping would discard
    /// per-line detail.
    pub fn with_preserve_error(mut self) -> Self {
        self.preserve_error = true;
        self.hints = self.hints.clone().with_preserve_error();
        self
    }

    pub fn for_stream(&self, labels: Labels) -> StreamSampleExtractor {
        StreamSampleExtractor {
            stages: self.stages.clone(),
            kind: self.kind.clone(),
            grouping: self.grouping.clone(),
            preserve_error: self.preserve_error,
            results: Arc::clone(&self.cache.results),
            builder: self.cache.builder(labels, &self.hints),
        }
    }
}

/// A sample extractor bound to one stream.
#[derive(Debug)]
pub struct StreamSampleExtractor {
    stages: Vec<Stage>,
    kind: CompiledKind,
    grouping: Option<Grouping>,
    preserve_error: bool,
    results: ResultCache,
    builder: LabelsBuilder,
}

impl StreamSampleExtractor {
    /// Processes one line, returning the derived sample and its grouped
    /// labels, or `None` when the line does not yield a sample.
    pub fn process(
        &mut self,
        ts: i64,
        line: &str,
        structured_metadata: &[Label],
    ) -> Option<(f64, Arc<LabelsResult>)> {
        self.builder.reset();
        for label in structured_metadata {
            self.builder.add_structured_metadata(&label.name, &label.value);
        }
        let mut current = Cow::Borrowed(line);
        for stage in &mut self.stages {
            let (next, keep) = stage.process(ts, current, &mut self.builder);
            if !keep {
                return None;
            }
            current = next;
        }

        let value = match &self.kind {
            CompiledKind::Line(LineSampleKind::Count) => 1.0,
            CompiledKind::Line(LineSampleKind::Bytes) => current.len() as f64,
            CompiledKind::Label {
                name,
                conversion,
                post_filters,
            } => {
                let value = match self.builder.get(name).map(str::to_string) {
                    Some(raw) => match convert(*conversion, &raw) {
                        Some(value) => value,
                        None => {
                            self.builder.set_error(
                                SAMPLE_EXTRACTION_ERROR,
                                &format!("cannot convert label value {raw:?}"),
                            );
                            0.0
                        }
                    },
                    None => {
                        self.builder.set_error(
                            SAMPLE_EXTRACTION_ERROR,
                            &format!("label {name} is not present"),
                        );
                        0.0
                    }
                };
                // The post filter is how conversion failures get dropped.
                for filter in post_filters {
                    if !filter.process(&mut self.builder) {
                        return None;
                    }
                }
                value
            }
        };

        let result = self.builder.labels_result();
        Some((value, self.grouped(result)))
    }

    /// Applies the aggregation grouping to a finalized result, sharing
    /// the per-query result cache.
    fn grouped(&self, result: Arc<LabelsResult>) -> Arc<LabelsResult> {
        let Some(grouping) = &self.grouping else {
            return result;
        };
        let keep = |label: &&Label| -> bool {
            if label.name == ERROR_LABEL {
                return true;
            }
            if label.name == ERROR_DETAILS_LABEL {
                return self.preserve_error;
            }
            let listed = grouping.groups.iter().any(|g| *g == label.name);
            listed != grouping.without
        };
        let stream: Vec<Label> = result.stream().iter().filter(keep).cloned().collect();
        let structured: Vec<Label> = result
            .structured_metadata()
            .iter()
            .filter(keep)
            .cloned()
            .collect();
        let parsed: Vec<Label> = result.parsed().iter().filter(keep).cloned().collect();

        if stream.len() + structured.len() + parsed.len() == result.labels().len() {
            return result;
        }

        let grouped = LabelsResult::new(
            Labels::new(stream),
            Labels::new(structured),
            Labels::new(parsed),
        );
        let hash = grouped.labels().hash();
        if let Some(hit) = self.results.read().expect("result cache poisoned").get(&hash) {
            return Arc::clone(hit);
        }
        let grouped = Arc::new(grouped);
        self.results
            .write()
            .expect("result cache poisoned")
            .insert(hash, Arc::clone(&grouped));
        grouped
    }
}

fn collect_ranges<'a>(
    expr: &'a MetricExpr,
    parent: Option<&'a VectorAggExpr>,
    out: &mut Vec<(&'a RangeAggExpr, Option<&'a VectorAggExpr>)>,
) {
    match expr {
        MetricExpr::RangeAgg(range) => out.push((range, parent)),
        MetricExpr::VectorAgg(vector) => collect_ranges(&vector.expr, Some(vector), out),
        MetricExpr::BinOp(binop) => {
            collect_ranges(&binop.lhs, None, out);
            collect_ranges(&binop.rhs, None, out);
        }
        MetricExpr::Literal(_) | MetricExpr::Vector(_) => {}
    }
}

/// The grouping applied while extracting. A directly enclosing `sum` can
/// push its grouping into the range extractor when the range operation is
/// label-insensitive, which skips materializing labels the aggregation
/// would discard anyway.
fn effective_grouping(
    range_agg: &RangeAggExpr,
    parent: Option<&VectorAggExpr>,
) -> Option<Grouping> {
    if let Some(grouping) = &range_agg.grouping {
        return Some(grouping.clone());
    }
    let parent = parent?;
    let injectable = parent.op == VectorOp::Sum
        && matches!(
            range_agg.op,
            RangeOp::BytesOverTime
                | RangeOp::BytesRate
                | RangeOp::CountOverTime
                | RangeOp::Rate
                | RangeOp::SumOverTime
        );
    if injectable {
        Some(parent.grouping.clone())
    } else {
        None
    }
}

/// Extraction hints: only when grouping on a known label set can parsers
/// skip everything else. Formatting and drop/keep stages consult labels
/// the grouping does not mention, so their presence disables hinting.
fn build_hints(grouping: &Option<Grouping>, kind: &CompiledKind, stages: &[Stage]) -> ParserHints {
    let Some(grouping) = grouping else {
        return ParserHints::default();
    };
    if grouping.without {
        return ParserHints::default();
    }
    let mut required = grouping.groups.clone();
    if let CompiledKind::Label {
        name, post_filters, ..
    } = kind
    {
        if !required.iter().any(|r| r == name) {
            required.push(name.clone());
        }
        for filter in post_filters {
            filter.required_label_names(&mut required);
        }
    }
    for stage in stages {
        match stage {
            Stage::LabelFilter(filter) => filter.required_label_names(&mut required),
            Stage::LineFormat(_) | Stage::LabelFormat(_) | Stage::DropKeep(_) => {
                return ParserHints::default();
            }
            _ => {}
        }
    }
    ParserHints::new(required)
}

fn convert(conversion: Option<UnwrapConversion>, raw: &str) -> Option<f64> {
    match conversion {
        None => raw.parse::<f64>().ok(),
        Some(UnwrapConversion::Bytes) => parse_bytes(raw).map(|b| b as f64),
        Some(UnwrapConversion::Duration) | Some(UnwrapConversion::DurationSeconds) => {
            parse_duration(raw)
                .map(|d| d.as_secs_f64())
                .or_else(|| raw.parse::<f64>().ok())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::Expr;
    use crate::query::parse_expr;

    fn extractor(query: &str) -> SampleExtractor {
        let expr = match parse_expr(query).unwrap() {
            Expr::Metric(metric) => metric,
            other => panic!("expected metric query, got {other}"),
        };
        SampleExtractor::compile(&expr).unwrap()
    }

    #[test]
    fn test_count_extractor() {
        let extractor = extractor(r#"rate({app="x"} |= "err" [5m])"#);
        let mut stream = extractor.for_stream(Labels::from_pairs(&[("app", "x")]));

        let sample = stream.process(1, "an err line", &[]);
        assert_eq!(sample.unwrap().0, 1.0);
        assert!(stream.process(2, "all good", &[]).is_none());
    }

    #[test]
    fn test_bytes_extractor_uses_rewritten_line() {
        let extractor = extractor(r#"bytes_over_time({app="x"} | line_format "{{.app}}" [5m])"#);
        let mut stream = extractor.for_stream(Labels::from_pairs(&[("app", "x")]));
        let (value, _) = stream.process(1, "something much longer", &[]).unwrap();
        assert_eq!(value, 1.0); // the formatted line is just "x"
    }

    #[test]
    fn test_unwrap_duration_conversion() {
        let extractor =
            extractor(r#"avg_over_time({app="x"} | logfmt | unwrap duration(took) [5m])"#);
        let mut stream = extractor.for_stream(Labels::from_pairs(&[("app", "x")]));
        let (value, labels) = stream.process(1, "took=1500ms", &[]).unwrap();
        assert_eq!(value, 1.5);
        assert_eq!(labels.labels().get(ERROR_LABEL), None);
    }

    #[test]
    fn test_unwrap_failure_records_error() {
        let extractor = extractor(r#"sum_over_time({app="x"} | logfmt | unwrap took [5m])"#);
        let mut stream = extractor.for_stream(Labels::from_pairs(&[("app", "x")]));
        let (value, labels) = stream.process(1, "took=fast", &[]).unwrap();
        assert_eq!(value, 0.0);
        assert_eq!(
            labels.labels().get(ERROR_LABEL),
            Some(SAMPLE_EXTRACTION_ERROR)
        );
    }

    #[test]
    fn test_unwrap_post_filter_drops_failed_conversions() {
        let extractor = extractor(
            "sum_over_time({app=\"x\"} | logfmt | unwrap took | __error__=\"\" [5m])",
        );
        let mut stream = extractor.for_stream(Labels::from_pairs(&[("app", "x")]));
        assert!(stream.process(1, "took=fast", &[]).is_none());
        let (value, _) = stream.process(2, "took=3.5", &[]).unwrap();
        assert_eq!(value, 3.5);
    }

    #[test]
    fn test_grouping_by_restricts_labels() {
        let extractor =
            extractor(r#"avg_over_time({app="x"} | logfmt | unwrap took [5m]) by (pod)"#);
        let mut stream =
            extractor.for_stream(Labels::from_pairs(&[("app", "x"), ("pod", "api-0")]));
        let (_, labels) = stream.process(1, "took=2 other=ignored", &[]).unwrap();
        assert_eq!(labels.labels().get("pod"), Some("api-0"));
        assert_eq!(labels.labels().get("app"), None);
        assert_eq!(labels.labels().get("other"), None);
    }

    #[test]
    fn test_sum_injects_grouping_into_rate() {
        let extractor = extractor(r#"sum by (app) (rate({app="x"} | logfmt [5m]))"#);
        let mut stream =
            extractor.for_stream(Labels::from_pairs(&[("app", "x"), ("pod", "api-0")]));
        let (value, labels) = stream.process(1, "level=err", &[]).unwrap();
        assert_eq!(value, 1.0);
        assert_eq!(labels.labels().get("app"), Some("x"));
        assert_eq!(labels.labels().get("pod"), None);
    }

    #[test]
    fn test_binop_with_two_ranges_is_rejected() {
        let expr = match parse_expr(r#"rate({a="1"}[1m]) / rate({a="2"}[1m])"#).unwrap() {
            Expr::Metric(metric) => metric,
            _ => unreachable!(),
        };
        assert!(matches!(
            SampleExtractor::compile(&expr),
            Err(ExtractError::RangeCount(2))
        ));
    }
}
