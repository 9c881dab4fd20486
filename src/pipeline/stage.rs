//! Compiled pipeline stages.
//!
//! A stage is one executable step of a compiled query with the contract
//! `process(timestamp, line, labels) -> (line, keep)`. Stages own scratch
//! state reused across lines of one stream but are never shared between
//! streams; the stream pipeline clones them at specialization time.

use std::borrow::Cow;

use thiserror::Error;

use crate::query::ast::{reorder_stages, DropLabel, LabelFmtExpr, StageExpr};

use super::format::{decolorize, LabelFmt, LabelFormatError, LabelsFormatter, LineTemplate, TemplateError};
use super::label_filter::{value_matcher, LabelFilter, LabelFilterError};
use super::labels::LabelsBuilder;
use super::line_filter::{compile_line_filter, Filter, FilterError};
use super::parsers::{
    ExpressionError, JsonExpressionParser, JsonParser, LogfmtParser, PatternError, PatternParser,
    RegexpParser, RegexpParserError, UnpackParser,
};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    LabelFilter(#[from] LabelFilterError),
    #[error(transparent)]
    Regexp(#[from] RegexpParserError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    LabelFormat(#[from] LabelFormatError),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Compiled form of a `drop`/`keep` stage. Entries pair a label name with
/// an optional value matcher.
#[derive(Debug, Clone)]
pub struct LabelDropper {
    entries: Vec<(String, Option<Filter>)>,
    keep: bool,
}

impl LabelDropper {
    fn compile(labels: &[DropLabel], keep: bool) -> Result<Self, LabelFilterError> {
        let mut entries = Vec::with_capacity(labels.len());
        for label in labels {
            match label {
                DropLabel::Name(name) => entries.push((name.clone(), None)),
                DropLabel::Matcher(matcher) => {
                    entries.push((matcher.name.clone(), Some(value_matcher(matcher)?)))
                }
            }
        }
        Ok(Self { entries, keep })
    }

    fn matches(&self, name: &str, lbs: &LabelsBuilder) -> bool {
        self.entries.iter().any(|(entry_name, filter)| {
            entry_name == name
                && match filter {
                    None => true,
                    Some(filter) => lbs.get(name).map(|v| filter.filter(v)).unwrap_or(false),
                }
        })
    }

    fn process(&self, lbs: &mut LabelsBuilder) {
        if self.keep {
            for name in lbs.resolved_names() {
                if !self.matches(&name, lbs) {
                    lbs.del(&name);
                }
            }
            return;
        }
        // Dropping by explicit name also reaches the reserved error labels.
        for (name, filter) in &self.entries {
            let matched = match filter {
                None => true,
                Some(filter) => lbs.get(name).map(|v| filter.filter(v)).unwrap_or(false),
            };
            if matched {
                lbs.del(name);
            }
        }
    }
}

/// One executable pipeline step. The variant set is closed so dispatch
/// stays exhaustive.
#[derive(Debug, Clone)]
pub enum Stage {
    LineFilter(Filter),
    Json(JsonParser),
    JsonExpression(JsonExpressionParser),
    Logfmt(LogfmtParser),
    Regexp(RegexpParser),
    Pattern(PatternParser),
    Unpack(UnpackParser),
    Decolorize,
    LabelFilter(LabelFilter),
    LineFormat(LineTemplate),
    LabelFormat(LabelsFormatter),
    DropKeep(LabelDropper),
}

impl Stage {
    pub fn process<'a>(
        &mut self,
        _ts: i64,
        line: Cow<'a, str>,
        lbs: &mut LabelsBuilder,
    ) -> (Cow<'a, str>, bool) {
        match self {
            Stage::LineFilter(filter) => {
                let keep = filter.filter(&line);
                (line, keep)
            }
            Stage::Json(parser) => {
                parser.process(&line, lbs);
                (line, true)
            }
            Stage::JsonExpression(parser) => {
                parser.process(&line, lbs);
                (line, true)
            }
            Stage::Logfmt(parser) => {
                parser.process(&line, lbs);
                (line, true)
            }
            Stage::Regexp(parser) => {
                parser.process(&line, lbs);
                (line, true)
            }
            Stage::Pattern(parser) => {
                parser.process(&line, lbs);
                (line, true)
            }
            Stage::Unpack(parser) => match parser.process(&line, lbs) {
                Some(unpacked) => (Cow::Owned(unpacked), true),
                None => (line, true),
            },
            Stage::Decolorize => match line {
                Cow::Borrowed(borrowed) => (decolorize(borrowed), true),
                Cow::Owned(owned) => match decolorize(&owned) {
                    Cow::Borrowed(_) => (Cow::Owned(owned), true),
                    Cow::Owned(stripped) => (Cow::Owned(stripped), true),
                },
            },
            Stage::LabelFilter(filter) => {
                let keep = filter.process(lbs);
                (line, keep)
            }
            Stage::LineFormat(template) => {
                let formatted = template.render(&line, lbs);
                (Cow::Owned(formatted), true)
            }
            Stage::LabelFormat(formatter) => {
                formatter.process(&line, lbs);
                (line, true)
            }
            Stage::DropKeep(dropper) => {
                dropper.process(lbs);
                (line, true)
            }
        }
    }
}

/// Compiles one stage expression; no-op stages compile to `None` and are
/// dropped from the pipeline.
pub fn compile_stage(expr: &StageExpr) -> Result<Option<Stage>, CompileError> {
    let stage = match expr {
        StageExpr::LineFilter(filter) => {
            let compiled = compile_line_filter(filter)?;
            if compiled.is_trivial_true() {
                return Ok(None);
            }
            Stage::LineFilter(compiled)
        }
        StageExpr::Json { expressions } => {
            if expressions.is_empty() {
                Stage::Json(JsonParser::new())
            } else {
                let pairs: Vec<(String, String)> = expressions
                    .iter()
                    .map(|e| (e.label.clone(), e.expression.clone()))
                    .collect();
                Stage::JsonExpression(JsonExpressionParser::new(&pairs)?)
            }
        }
        StageExpr::Logfmt {
            strict,
            keep_empty,
            expressions,
        } => {
            let pairs: Vec<(String, String)> = expressions
                .iter()
                .map(|e| (e.label.clone(), e.expression.clone()))
                .collect();
            Stage::Logfmt(LogfmtParser::new(*strict, *keep_empty, pairs))
        }
        StageExpr::Regexp { pattern } => Stage::Regexp(RegexpParser::new(pattern)?),
        StageExpr::Pattern { pattern } => Stage::Pattern(PatternParser::new(pattern)?),
        StageExpr::Unpack => Stage::Unpack(UnpackParser::new()),
        StageExpr::Decolorize => Stage::Decolorize,
        StageExpr::LabelFilter(filter) => {
            let compiled = LabelFilter::compile(filter)?;
            if compiled.is_noop() {
                return Ok(None);
            }
            Stage::LabelFilter(compiled)
        }
        StageExpr::LineFormat { template } => Stage::LineFormat(LineTemplate::compile(template)?),
        StageExpr::LabelFormat { formats } => {
            Stage::LabelFormat(LabelsFormatter::new(compile_label_formats(formats)?)?)
        }
        StageExpr::DropLabels { labels } => Stage::DropKeep(LabelDropper::compile(labels, false)?),
        StageExpr::KeepLabels { labels } => Stage::DropKeep(LabelDropper::compile(labels, true)?),
    };
    Ok(Some(stage))
}

fn compile_label_formats(formats: &[LabelFmtExpr]) -> Result<Vec<LabelFmt>, CompileError> {
    formats
        .iter()
        .map(|format| {
            Ok(if format.rename {
                LabelFmt::Rename {
                    target: format.target.clone(),
                    source: format.value.clone(),
                }
            } else {
                LabelFmt::Template {
                    target: format.target.clone(),
                    template: LineTemplate::compile(&format.value)?,
                }
            })
        })
        .collect()
}

/// Reorders and compiles a full stage list.
pub fn compile_stages(stages: &[StageExpr]) -> Result<Vec<Stage>, CompileError> {
    let mut compiled = Vec::with_capacity(stages.len());
    for stage in reorder_stages(stages.to_vec()) {
        if let Some(stage) = compile_stage(&stage)? {
            compiled.push(stage);
        }
    }
    Ok(compiled)
}
