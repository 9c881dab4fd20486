//! Query parsing: text to expression tree.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::Expr;

use thiserror::Error;
use tracing::debug;

use crate::metrics;

use lexer::Lexer;
use parser::Parser;

/// Queries larger than this are rejected before tokenization.
pub const MAX_QUERY_LENGTH: usize = 128 * 1024;

/// A lexical or grammatical failure, with source position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at line {line}, col {column}: {msg}")]
pub struct ParseError {
    pub msg: String,
    pub line: u32,
    pub column: u32,
}

/// A well-formed but disallowed query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("queries require at least one regexp or equality matcher that does not match empty values")]
    EmptyCompatibleMatchers,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("query length {0} exceeds limit {MAX_QUERY_LENGTH}")]
    QueryTooLong(usize),
}

/// Parses query text into an expression tree.
pub fn parse_expr(input: &str) -> Result<Expr, QueryError> {
    if input.len() > MAX_QUERY_LENGTH {
        metrics::record_query_rejected();
        return Err(QueryError::QueryTooLong(input.len()));
    }
    let (tokens, errors) = Lexer::new(input).tokenize();
    if let Some(error) = errors.into_iter().next() {
        metrics::record_query_rejected();
        debug!(%error, "rejecting query with lexical error");
        return Err(error.into());
    }
    let expr = Parser::new(tokens).parse().map_err(|error| {
        metrics::record_query_rejected();
        debug!(%error, "rejecting query with grammar error");
        error
    })?;
    validate(&expr)?;
    metrics::record_query_parsed();
    Ok(expr)
}

/// Every selector must narrow the stream set: at least one matcher that
/// cannot match the empty value. `{app=~".*"}` alone would force an
/// unbounded scan and is rejected.
fn validate(expr: &Expr) -> Result<(), ValidationError> {
    for selector in expr.selectors() {
        if !selector.matchers.iter().any(|m| !m.matches_empty()) {
            metrics::record_query_rejected();
            return Err(ValidationError::EmptyCompatibleMatchers);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ast::*;
    use super::*;
    use std::time::Duration;

    fn parse(input: &str) -> Expr {
        parse_expr(input).unwrap_or_else(|err| panic!("parse {input:?}: {err}"))
    }

    /// Reparsing the rendered form of a query must yield a structurally
    /// equal tree.
    fn assert_round_trip(input: &str) {
        let expr = parse(input);
        let rendered = expr.to_string();
        let reparsed = parse(&rendered);
        assert_eq!(expr, reparsed, "round trip changed {input:?} -> {rendered:?}");
    }

    #[test]
    fn test_parse_selector() {
        let expr = parse(r#"{app="api", env!="dev"}"#);
        match &expr {
            Expr::Log(LogExpr::Selector(selector)) => {
                assert_eq!(selector.matchers.len(), 2);
                assert_eq!(selector.matchers[0].name, "app");
                assert_eq!(selector.matchers[1].op, MatchOp::Neq);
            }
            other => panic!("expected selector, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_pipeline_stages() {
        let expr = parse(
            r#"{app="api"} |= "err" | logfmt --strict | duration > 200ms | line_format "{{.msg}}""#,
        );
        match &expr {
            Expr::Log(LogExpr::Pipeline(pipeline)) => {
                assert_eq!(pipeline.stages.len(), 4);
                assert!(matches!(pipeline.stages[0], StageExpr::LineFilter(_)));
                assert!(matches!(
                    pipeline.stages[1],
                    StageExpr::Logfmt { strict: true, .. }
                ));
                assert!(matches!(pipeline.stages[2], StageExpr::LabelFilter(_)));
                assert!(matches!(pipeline.stages[3], StageExpr::LineFormat { .. }));
            }
            other => panic!("expected pipeline, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_metric_query() {
        let expr = parse(r#"sum by (app) (rate({app="api"}[5m]))"#);
        match &expr {
            Expr::Metric(MetricExpr::VectorAgg(agg)) => {
                assert_eq!(agg.op, VectorOp::Sum);
                assert_eq!(agg.grouping.groups, vec!["app".to_string()]);
                match agg.expr.as_ref() {
                    MetricExpr::RangeAgg(range) => {
                        assert_eq!(range.op, RangeOp::Rate);
                        assert_eq!(range.range.interval, Duration::from_secs(300));
                    }
                    other => panic!("expected range agg, got {other:?}"),
                }
            }
            other => panic!("expected vector agg, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unwrap_with_conversion_and_offset() {
        let expr = parse(
            r#"quantile_over_time(0.99,{app="api"} | logfmt | unwrap duration(took) [5m] offset 1m) by (pod)"#,
        );
        match &expr {
            Expr::Metric(MetricExpr::RangeAgg(agg)) => {
                assert_eq!(agg.op, RangeOp::QuantileOverTime);
                assert_eq!(agg.param, Some(0.99));
                assert_eq!(agg.range.offset, Duration::from_secs(60));
                let unwrap = agg.range.unwrap.as_ref().unwrap();
                assert_eq!(unwrap.identifier, "took");
                assert_eq!(unwrap.conversion, Some(UnwrapConversion::Duration));
                assert_eq!(
                    agg.grouping.as_ref().unwrap().groups,
                    vec!["pod".to_string()]
                );
            }
            other => panic!("expected range agg, got {other:?}"),
        }
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(parse("1 + 2 * 3"), Expr::Metric(MetricExpr::Literal(7.0)));
        assert_eq!(parse("2 ^ 3 ^ 2"), Expr::Metric(MetricExpr::Literal(512.0)));
        assert_eq!(parse("4 > 3"), Expr::Metric(MetricExpr::Literal(1.0)));
        // Division by zero folds to NaN rather than failing.
        match parse("1 / 0") {
            Expr::Metric(MetricExpr::Literal(value)) => assert!(value.is_nan()),
            other => panic!("expected literal, got {other:?}"),
        }
    }

    #[test]
    fn test_logical_op_with_literal_leg_is_rejected() {
        assert!(matches!(
            parse_expr(r#"1 and rate({app="x"}[1m])"#),
            Err(QueryError::Parse(_))
        ));
    }

    #[test]
    fn test_binop_precedence() {
        let expr = parse(r#"rate({a="1"}[1m]) + rate({a="2"}[1m]) * 2"#);
        match expr {
            Expr::Metric(MetricExpr::BinOp(binop)) => {
                assert_eq!(binop.op, BinaryOp::Add);
                assert!(matches!(*binop.rhs, MetricExpr::BinOp(ref inner) if inner.op == BinaryOp::Mul));
            }
            other => panic!("expected binop, got {other:?}"),
        }
    }

    #[test]
    fn test_vector_matching_modifiers() {
        let expr = parse(
            r#"sum(rate({a="1"}[1m])) / ignoring (pod) group_left (app) sum(rate({a="2"}[1m]))"#,
        );
        match expr {
            Expr::Metric(MetricExpr::BinOp(binop)) => {
                let matching = binop.modifier.matching.unwrap();
                assert!(!matching.on);
                assert_eq!(matching.labels, vec!["pod".to_string()]);
                assert_eq!(matching.card, MatchCardinality::ManyToOne);
                assert_eq!(matching.include, vec!["app".to_string()]);
            }
            other => panic!("expected binop, got {other:?}"),
        }
    }

    #[test]
    fn test_round_trips() {
        for query in [
            r#"{app="api"}"#,
            r#"{app="api", env!~"dev.*"}"#,
            r#"{app="api"} |= "err" != "debug""#,
            r#"{app="api"} |= "foo" or "bar" or "baz""#,
            r#"{app="api"} |= ip("10.0.0.0/8")"#,
            r#"{app="api"} |~ "err.*" | json | level="err""#,
            r#"{app="api"} | json first="servers[0]",ua="request.agent""#,
            r#"{app="api"} | logfmt --strict --keep-empty"#,
            r#"{app="api"} | regexp "(?P<level>\\w+)" | pattern "<ip> - <user>""#,
            r#"{app="api"} | unpack | decolorize"#,
            r#"{app="api"} | line_format "{{.msg}}" | label_format level=severity,code="{{.status}}""#,
            r#"{app="api"} | drop pod,env="dev" | keep app"#,
            r#"{app="api"} | duration>=200ms, size>5KiB or status>=500"#,
            r#"{app="api"} | addr=ip("192.168.0.0/16")"#,
            r#"rate({app="api"}[5m])"#,
            r#"bytes_rate({app="api"}[1h] offset 10m)"#,
            r#"count_over_time({app="api"} |= "err" [5m])"#,
            r#"avg_over_time({app="api"} | logfmt | unwrap duration(took) [5m]) by (pod)"#,
            r#"quantile_over_time(0.95,{app="api"} | unwrap bytes(size) [1m])"#,
            r#"sum by (app) (rate({app="api"}[5m]))"#,
            r#"topk(5,sum by (app) (rate({app="api"}[5m])))"#,
            r#"sum(rate({a="1"}[1m])) / ignoring (pod) group_left () sum(rate({a="2"}[1m]))"#,
            r#"(sum(rate({a="1"}[1m])) > bool 5)"#,
            r#"vector(0.5)"#,
            r#"sum_over_time({app="api"} | logfmt | unwrap took | __error__="" [5m])"#,
        ] {
            assert_round_trip(query);
        }
    }

    #[test]
    fn test_serialized_form_reconstructs_tree() {
        let expr = parse(r#"sum by (app) (rate({app="api"} |= "err" | json [5m]))"#);
        let encoded = serde_json::to_string(&expr).unwrap();
        let decoded: Expr = serde_json::from_str(&encoded).unwrap();
        assert_eq!(expr, decoded);
    }

    #[test]
    fn test_empty_compatible_selector_is_rejected() {
        let err = parse_expr(r#"{app=~".*"}"#).unwrap_err();
        assert_eq!(
            err,
            QueryError::Validation(ValidationError::EmptyCompatibleMatchers)
        );
        assert!(!err.to_string().is_empty());

        assert!(parse_expr(r#"{app=~".+"}"#).is_ok());
        assert!(matches!(
            parse_expr(r#"{}"#),
            Err(QueryError::Validation(_))
        ));
        // One narrowing matcher is enough.
        assert!(parse_expr(r#"{app=~".*", env="prod"}"#).is_ok());
    }

    #[test]
    fn test_query_length_limit() {
        let long = format!(r#"{{app="{}"}}"#, "x".repeat(MAX_QUERY_LENGTH));
        assert!(matches!(
            parse_expr(&long),
            Err(QueryError::QueryTooLong(_))
        ));
    }

    #[test]
    fn test_parse_error_carries_position() {
        let err = parse_expr(r#"{app="api"} |= "#).unwrap_err();
        match err {
            QueryError::Parse(parse) => {
                assert_eq!(parse.line, 1);
                assert!(parse.column > 1);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_grouping_validation() {
        assert!(matches!(
            parse_expr(r#"rate({app="x"}[5m]) by (pod)"#),
            Err(QueryError::Parse(_))
        ));
        assert!(matches!(
            parse_expr(r#"avg_over_time({app="x"}[5m])"#),
            Err(QueryError::Parse(_))
        ));
        assert!(matches!(
            parse_expr(r#"quantile_over_time({app="x"} | unwrap x [5m])"#),
            Err(QueryError::Parse(_))
        ));
        assert!(matches!(
            parse_expr(r#"topk(rate({app="x"}[5m]))"#),
            Err(QueryError::Parse(_))
        ));
    }

    #[test]
    fn test_unwrap_outside_range_is_rejected() {
        assert!(matches!(
            parse_expr(r#"{app="x"} | unwrap took"#),
            Err(QueryError::Parse(_))
        ));
    }

    #[test]
    fn test_literal_first_comparison_flips() {
        let expr = parse(r#"{app="x"} | logfmt | 5.2 <= duration"#);
        match &expr {
            Expr::Log(LogExpr::Pipeline(pipeline)) => match &pipeline.stages[1] {
                StageExpr::LabelFilter(LabelFilterExpr::Numeric { name, op, value }) => {
                    assert_eq!(name, "duration");
                    assert_eq!(*op, ComparisonOp::Gte);
                    assert_eq!(*value, 5.2);
                }
                other => panic!("expected numeric label filter, got {other:?}"),
            },
            other => panic!("expected pipeline, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_or_chain_renders_as_and_chain() {
        let expr = parse(r#"{app="api"} != "foo" or "bar""#);
        assert_eq!(expr.to_string(), r#"{app="api"} != "foo" != "bar""#);
        // The rendered form reparses cleanly to the equivalent AND chain.
        parse(&expr.to_string());
    }

    #[test]
    fn test_function_names_stay_identifiers_in_label_positions() {
        // `rate` and `count` are ordinary labels here.
        assert!(parse_expr(r#"{rate="high", count="3"}"#).is_ok());
        assert!(parse_expr(r#"{app="x"} | logfmt | rate > 5"#).is_ok());
    }
}
