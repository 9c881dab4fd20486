//! The expression tree produced by the parser.
//!
//! Every node renders back to query text via `Display` and reparsing that
//! text yields a structurally equal tree. Nodes are plain data: cloning
//! deep-copies, and serde gives a structured serialized form that
//! reconstructs an equivalent tree without reparsing.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::lexer::{format_bytes, format_duration};

/// How a selector matcher compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOp {
    Eq,
    Neq,
    Re,
    NotRe,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchOp::Eq => "=",
            MatchOp::Neq => "!=",
            MatchOp::Re => "=~",
            MatchOp::NotRe => "!~",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl LabelMatcher {
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op,
            value: value.into(),
        }
    }

    /// Whether this matcher accepts the empty value, i.e. cannot narrow
    /// the set of matched streams on its own.
    pub fn matches_empty(&self) -> bool {
        match self.op {
            MatchOp::Eq => self.value.is_empty(),
            MatchOp::Neq => !self.value.is_empty(),
            MatchOp::Re => regex::Regex::new(&format!("^(?:{})$", self.value))
                .map(|re| re.is_match(""))
                .unwrap_or(false),
            MatchOp::NotRe => regex::Regex::new(&format!("^(?:{})$", self.value))
                .map(|re| !re.is_match(""))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// Stream selector: `{app="api", env!="dev"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorExpr {
    pub matchers: Vec<LabelMatcher>,
}

impl fmt::Display for SelectorExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, matcher) in self.matchers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{matcher}")?;
        }
        write!(f, "}}")
    }
}

/// Line filter match types, in wire-encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineMatchType {
    Equal,
    NotEqual,
    Regexp,
    NotRegexp,
    Pattern,
    NotPattern,
}

impl LineMatchType {
    /// Positive types alternate under `or`; negative types distribute by
    /// De Morgan into AND chains of negations.
    pub fn is_positive(self) -> bool {
        matches!(
            self,
            LineMatchType::Equal | LineMatchType::Regexp | LineMatchType::Pattern
        )
    }
}

impl fmt::Display for LineMatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LineMatchType::Equal => "|=",
            LineMatchType::NotEqual => "!=",
            LineMatchType::Regexp => "|~",
            LineMatchType::NotRegexp => "!~",
            LineMatchType::Pattern => "|>",
            LineMatchType::NotPattern => "!>",
        })
    }
}

/// Operator name for line filters wrapping their match text in a function,
/// currently only `ip(...)`.
pub const LINE_FILTER_OP_IP: &str = "ip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineFilter {
    pub ty: LineMatchType,
    pub match_text: String,
    pub op: Option<String>,
}

impl LineFilter {
    pub fn is_ip(&self) -> bool {
        self.op.as_deref() == Some(LINE_FILTER_OP_IP)
    }
}

/// One line filter clause.
///
/// `left` chains sequential AND composition across clauses; `or` chains
/// alternation within one clause. An `or` child never prints its own match
/// type, it inherits the chain's left-most operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineFilterExpr {
    pub filter: LineFilter,
    pub left: Option<Box<LineFilterExpr>>,
    pub or: Option<Box<LineFilterExpr>>,
    pub is_or_child: bool,
}

impl LineFilterExpr {
    pub fn new(ty: LineMatchType, match_text: String, op: Option<String>) -> Self {
        Self {
            filter: LineFilter {
                ty,
                match_text,
                op,
            },
            left: None,
            or: None,
            is_or_child: false,
        }
    }
}

/// Combines `left or right` into one clause.
///
/// The match type of the left-most operand wins for the whole chain. For
/// negative types the alternation is algebraically inverted: `not (a or
/// b)` is `not a and not b`, so the chain flattens into a left-linked AND
/// chain of negations.
pub fn new_or_line_filter(mut left: LineFilterExpr, mut right: LineFilterExpr) -> LineFilterExpr {
    right.filter.ty = left.filter.ty;
    let mut cursor = right.or.as_deref_mut();
    while let Some(node) = cursor {
        node.filter.ty = left.filter.ty;
        cursor = node.or.as_deref_mut();
    }

    if left.filter.ty.is_positive() {
        right.is_or_child = true;
        left.or = Some(Box::new(right));
        return left;
    }

    new_nested_line_filter(left, right)
}

fn new_nested_line_filter(mut left: LineFilterExpr, mut right: LineFilterExpr) -> LineFilterExpr {
    if right.or.is_some() && !right.filter.ty.is_positive() {
        let mut or = right.or.take().expect("checked above");
        or.is_or_child = false;
        right = new_nested_line_filter(right, *or);
    }
    if let Some(right_left) = right.left.take() {
        left = new_nested_line_filter(left, *right_left);
    }
    LineFilterExpr {
        filter: right.filter,
        left: Some(Box::new(left)),
        or: right.or,
        is_or_child: right.is_or_child,
    }
}

impl fmt::Display for LineFilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(left) = &self.left {
            write!(f, "{left} ")?;
        }
        if !self.is_or_child {
            write!(f, "{} ", self.filter.ty)?;
        }
        match &self.filter.op {
            Some(op) => write!(f, "{op}({:?})", self.filter.match_text)?,
            None => write!(f, "{:?}", self.filter.match_text)?,
        }
        if let Some(or) = &self.or {
            write!(f, " or {or}")?;
        }
        Ok(())
    }
}

/// Numeric comparison operators used by label filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ComparisonOp {
    /// Mirrors the comparison for a flipped operand order.
    pub fn flipped(self) -> Self {
        match self {
            ComparisonOp::Eq => ComparisonOp::Eq,
            ComparisonOp::Neq => ComparisonOp::Neq,
            ComparisonOp::Gt => ComparisonOp::Lt,
            ComparisonOp::Gte => ComparisonOp::Lte,
            ComparisonOp::Lt => ComparisonOp::Gt,
            ComparisonOp::Lte => ComparisonOp::Gte,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComparisonOp::Eq => "==",
            ComparisonOp::Neq => "!=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Gte => ">=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Lte => "<=",
        })
    }
}

/// Label filter predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LabelFilterExpr {
    And(Box<LabelFilterExpr>, Box<LabelFilterExpr>),
    Or(Box<LabelFilterExpr>, Box<LabelFilterExpr>),
    Matcher(LabelMatcher),
    Numeric {
        name: String,
        op: ComparisonOp,
        value: f64,
    },
    Duration {
        name: String,
        op: ComparisonOp,
        value: Duration,
    },
    Bytes {
        name: String,
        op: ComparisonOp,
        value: u64,
    },
    Ip {
        name: String,
        negated: bool,
        pattern: String,
    },
}

impl fmt::Display for LabelFilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelFilterExpr::And(left, right) => write!(f, "({left} and {right})"),
            LabelFilterExpr::Or(left, right) => write!(f, "({left} or {right})"),
            LabelFilterExpr::Matcher(matcher) => write!(f, "{matcher}"),
            LabelFilterExpr::Numeric { name, op, value } => write!(f, "{name}{op}{value}"),
            LabelFilterExpr::Duration { name, op, value } => {
                write!(f, "{name}{op}{}", format_duration(*value))
            }
            LabelFilterExpr::Bytes { name, op, value } => {
                write!(f, "{name}{op}{}", format_bytes(*value))
            }
            LabelFilterExpr::Ip {
                name,
                negated,
                pattern,
            } => {
                let op = if *negated { "!=" } else { "=" };
                write!(f, "{name}{op}ip({pattern:?})")
            }
        }
    }
}

/// A `drop`/`keep` target: a bare label name or a full matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropLabel {
    Name(String),
    Matcher(LabelMatcher),
}

impl fmt::Display for DropLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropLabel::Name(name) => write!(f, "{name}"),
            DropLabel::Matcher(matcher) => write!(f, "{matcher}"),
        }
    }
}

/// One `label_format` rule; `rename` moves a label, otherwise the value is
/// a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFmtExpr {
    pub target: String,
    pub value: String,
    pub rename: bool,
}

impl fmt::Display for LabelFmtExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rename {
            write!(f, "{}={}", self.target, self.value)
        } else {
            write!(f, "{}={:?}", self.target, self.value)
        }
    }
}

/// A `(label, path)` extraction expression for json/logfmt stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionExpr {
    pub label: String,
    pub expression: String,
}

impl fmt::Display for ExtractionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}", self.label, self.expression)
    }
}

/// One stage of a log pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageExpr {
    LineFilter(LineFilterExpr),
    Json {
        expressions: Vec<ExtractionExpr>,
    },
    Logfmt {
        strict: bool,
        keep_empty: bool,
        expressions: Vec<ExtractionExpr>,
    },
    Regexp {
        pattern: String,
    },
    Pattern {
        pattern: String,
    },
    Unpack,
    Decolorize,
    LabelFilter(LabelFilterExpr),
    LineFormat {
        template: String,
    },
    LabelFormat {
        formats: Vec<LabelFmtExpr>,
    },
    DropLabels {
        labels: Vec<DropLabel>,
    },
    KeepLabels {
        labels: Vec<DropLabel>,
    },
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for StageExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageExpr::LineFilter(filter) => write!(f, "{filter}"),
            StageExpr::Json { expressions } => {
                write!(f, "| json")?;
                if !expressions.is_empty() {
                    write!(f, " ")?;
                    write_list(f, expressions)?;
                }
                Ok(())
            }
            StageExpr::Logfmt {
                strict,
                keep_empty,
                expressions,
            } => {
                write!(f, "| logfmt")?;
                if *strict {
                    write!(f, " --strict")?;
                }
                if *keep_empty {
                    write!(f, " --keep-empty")?;
                }
                if !expressions.is_empty() {
                    write!(f, " ")?;
                    write_list(f, expressions)?;
                }
                Ok(())
            }
            StageExpr::Regexp { pattern } => write!(f, "| regexp {pattern:?}"),
            StageExpr::Pattern { pattern } => write!(f, "| pattern {pattern:?}"),
            StageExpr::Unpack => write!(f, "| unpack"),
            StageExpr::Decolorize => write!(f, "| decolorize"),
            StageExpr::LabelFilter(filter) => write!(f, "| {filter}"),
            StageExpr::LineFormat { template } => write!(f, "| line_format {template:?}"),
            StageExpr::LabelFormat { formats } => {
                write!(f, "| label_format ")?;
                write_list(f, formats)
            }
            StageExpr::DropLabels { labels } => {
                write!(f, "| drop ")?;
                write_list(f, labels)
            }
            StageExpr::KeepLabels { labels } => {
                write!(f, "| keep ")?;
                write_list(f, labels)
            }
        }
    }
}

/// Reorders stages so line filters run as early as possible.
///
/// Label filters flush pending groups in order. Stages that rewrite line
/// content (`line_format`, `unpack`) are barriers: a line filter written
/// after one must stay after it. Collected consecutive line filters merge
/// into one left-linked chain.
pub fn reorder_stages(stages: Vec<StageExpr>) -> Vec<StageExpr> {
    let mut result = Vec::with_capacity(stages.len());
    let mut line_filters: Vec<LineFilterExpr> = Vec::new();
    let mut others: Vec<StageExpr> = Vec::new();

    fn flush(
        result: &mut Vec<StageExpr>,
        line_filters: &mut Vec<LineFilterExpr>,
        others: &mut Vec<StageExpr>,
    ) {
        if !line_filters.is_empty() {
            result.push(StageExpr::LineFilter(combine_filters(std::mem::take(
                line_filters,
            ))));
        }
        result.append(others);
    }

    for stage in stages {
        match stage {
            StageExpr::LabelFilter(_) => {
                flush(&mut result, &mut line_filters, &mut others);
                result.push(stage);
            }
            StageExpr::LineFilter(filter) => line_filters.push(filter),
            StageExpr::LineFormat { .. } | StageExpr::Unpack => {
                others.push(stage);
                flush(&mut result, &mut line_filters, &mut others);
            }
            other => others.push(other),
        }
    }
    flush(&mut result, &mut line_filters, &mut others);
    result
}

fn combine_filters(mut filters: Vec<LineFilterExpr>) -> LineFilterExpr {
    let mut result = filters.pop().expect("combine_filters on empty list");
    while let Some(previous) = filters.pop() {
        attach_leftmost(&mut result, previous);
    }
    result
}

fn attach_leftmost(node: &mut LineFilterExpr, child: LineFilterExpr) {
    match &mut node.left {
        Some(left) => attach_leftmost(left, child),
        None => node.left = Some(Box::new(child)),
    }
}

/// A log query: a selector, optionally followed by pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogExpr {
    Selector(SelectorExpr),
    Pipeline(PipelineExpr),
}

impl LogExpr {
    pub fn selector(&self) -> &SelectorExpr {
        match self {
            LogExpr::Selector(selector) => selector,
            LogExpr::Pipeline(pipeline) => &pipeline.selector,
        }
    }

    pub fn stages(&self) -> &[StageExpr] {
        match self {
            LogExpr::Selector(_) => &[],
            LogExpr::Pipeline(pipeline) => &pipeline.stages,
        }
    }
}

impl fmt::Display for LogExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogExpr::Selector(selector) => write!(f, "{selector}"),
            LogExpr::Pipeline(pipeline) => write!(f, "{pipeline}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExpr {
    pub selector: SelectorExpr,
    pub stages: Vec<StageExpr>,
}

impl fmt::Display for PipelineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.selector)?;
        for stage in &self.stages {
            write!(f, " {stage}")?;
        }
        Ok(())
    }
}

/// Conversion applied to an unwrapped label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnwrapConversion {
    Bytes,
    Duration,
    DurationSeconds,
}

impl UnwrapConversion {
    pub fn as_str(self) -> &'static str {
        match self {
            UnwrapConversion::Bytes => "bytes",
            UnwrapConversion::Duration => "duration",
            UnwrapConversion::DurationSeconds => "duration_seconds",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwrapExpr {
    pub identifier: String,
    pub conversion: Option<UnwrapConversion>,
    pub post_filters: Vec<LabelFilterExpr>,
}

impl fmt::Display for UnwrapExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.conversion {
            Some(conversion) => {
                write!(f, " | unwrap {}({})", conversion.as_str(), self.identifier)?
            }
            None => write!(f, " | unwrap {}", self.identifier)?,
        }
        for filter in &self.post_filters {
            write!(f, " | {filter}")?;
        }
        Ok(())
    }
}

/// A log selector bounded by a range window: `{..} | stages [5m] offset 1m`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRangeExpr {
    pub selector: LogExpr,
    pub interval: Duration,
    pub offset: Duration,
    pub unwrap: Option<UnwrapExpr>,
}

impl fmt::Display for LogRangeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.selector)?;
        if let Some(unwrap) = &self.unwrap {
            write!(f, "{unwrap}")?;
        }
        write!(f, "[{}]", format_duration(self.interval))?;
        if !self.offset.is_zero() {
            write!(f, " offset {}", format_duration(self.offset))?;
        }
        Ok(())
    }
}

/// Range aggregation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeOp {
    CountOverTime,
    Rate,
    BytesOverTime,
    BytesRate,
    AbsentOverTime,
    AvgOverTime,
    SumOverTime,
    MinOverTime,
    MaxOverTime,
    StddevOverTime,
    StdvarOverTime,
    QuantileOverTime,
    FirstOverTime,
    LastOverTime,
}

impl RangeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            RangeOp::CountOverTime => "count_over_time",
            RangeOp::Rate => "rate",
            RangeOp::BytesOverTime => "bytes_over_time",
            RangeOp::BytesRate => "bytes_rate",
            RangeOp::AbsentOverTime => "absent_over_time",
            RangeOp::AvgOverTime => "avg_over_time",
            RangeOp::SumOverTime => "sum_over_time",
            RangeOp::MinOverTime => "min_over_time",
            RangeOp::MaxOverTime => "max_over_time",
            RangeOp::StddevOverTime => "stddev_over_time",
            RangeOp::StdvarOverTime => "stdvar_over_time",
            RangeOp::QuantileOverTime => "quantile_over_time",
            RangeOp::FirstOverTime => "first_over_time",
            RangeOp::LastOverTime => "last_over_time",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "count_over_time" => RangeOp::CountOverTime,
            "rate" => RangeOp::Rate,
            "bytes_over_time" => RangeOp::BytesOverTime,
            "bytes_rate" => RangeOp::BytesRate,
            "absent_over_time" => RangeOp::AbsentOverTime,
            "avg_over_time" => RangeOp::AvgOverTime,
            "sum_over_time" => RangeOp::SumOverTime,
            "min_over_time" => RangeOp::MinOverTime,
            "max_over_time" => RangeOp::MaxOverTime,
            "stddev_over_time" => RangeOp::StddevOverTime,
            "stdvar_over_time" => RangeOp::StdvarOverTime,
            "quantile_over_time" => RangeOp::QuantileOverTime,
            "first_over_time" => RangeOp::FirstOverTime,
            "last_over_time" => RangeOp::LastOverTime,
            _ => return None,
        })
    }
}

/// Grouping clause of an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grouping {
    pub groups: Vec<String>,
    pub without: bool,
}

impl Grouping {
    /// Grouping that reduces the result to a single series.
    pub fn is_singleton(&self) -> bool {
        self.groups.is_empty() && !self.without
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.without {
            write!(f, " without ")?;
        } else {
            write!(f, " by ")?;
        }
        write!(f, "({})", self.groups.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeAggExpr {
    pub op: RangeOp,
    pub range: LogRangeExpr,
    pub param: Option<f64>,
    pub grouping: Option<Grouping>,
}

impl RangeAggExpr {
    /// Checks the grouping/unwrap/parameter compatibility rules.
    pub fn validate(&self) -> Result<(), String> {
        use RangeOp::*;
        if self.grouping.is_some()
            && !matches!(
                self.op,
                AvgOverTime
                    | StddevOverTime
                    | StdvarOverTime
                    | QuantileOverTime
                    | MaxOverTime
                    | MinOverTime
                    | FirstOverTime
                    | LastOverTime
            )
        {
            return Err(format!(
                "grouping not allowed for {} aggregation",
                self.op.as_str()
            ));
        }
        if self.param.is_some() && self.op != QuantileOverTime {
            return Err(format!(
                "parameter not supported for operation {}",
                self.op.as_str()
            ));
        }
        if self.param.is_none() && self.op == QuantileOverTime {
            return Err(format!(
                "parameter required for operation {}",
                self.op.as_str()
            ));
        }
        if self.range.unwrap.is_some() {
            return match self.op {
                AvgOverTime | SumOverTime | MaxOverTime | MinOverTime | StddevOverTime
                | StdvarOverTime | QuantileOverTime | Rate | AbsentOverTime | FirstOverTime
                | LastOverTime => Ok(()),
                _ => Err(format!(
                    "invalid aggregation {} with unwrap",
                    self.op.as_str()
                )),
            };
        }
        match self.op {
            BytesOverTime | BytesRate | CountOverTime | Rate | AbsentOverTime => Ok(()),
            _ => Err(format!(
                "invalid aggregation {} without unwrap",
                self.op.as_str()
            )),
        }
    }
}

impl fmt::Display for RangeAggExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.op.as_str())?;
        if let Some(param) = self.param {
            write!(f, "{param},")?;
        }
        write!(f, "{})", self.range)?;
        if let Some(grouping) = &self.grouping {
            write!(f, "{grouping}")?;
        }
        Ok(())
    }
}

/// Vector aggregation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
}

impl VectorOp {
    pub fn as_str(self) -> &'static str {
        match self {
            VectorOp::Sum => "sum",
            VectorOp::Avg => "avg",
            VectorOp::Min => "min",
            VectorOp::Max => "max",
            VectorOp::Count => "count",
            VectorOp::Stddev => "stddev",
            VectorOp::Stdvar => "stdvar",
            VectorOp::Topk => "topk",
            VectorOp::Bottomk => "bottomk",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sum" => VectorOp::Sum,
            "avg" => VectorOp::Avg,
            "min" => VectorOp::Min,
            "max" => VectorOp::Max,
            "count" => VectorOp::Count,
            "stddev" => VectorOp::Stddev,
            "stdvar" => VectorOp::Stdvar,
            "topk" => VectorOp::Topk,
            "bottomk" => VectorOp::Bottomk,
            _ => return None,
        })
    }

    pub fn requires_param(self) -> bool {
        matches!(self, VectorOp::Topk | VectorOp::Bottomk)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorAggExpr {
    pub op: VectorOp,
    pub expr: Box<MetricExpr>,
    pub param: Option<u64>,
    pub grouping: Grouping,
}

impl fmt::Display for VectorAggExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.as_str())?;
        if !self.grouping.is_singleton() {
            write!(f, "{}", self.grouping)?;
        }
        write!(f, "(")?;
        if let Some(param) = self.param {
            write!(f, "{param},")?;
        }
        write!(f, "{})", self.expr)
    }
}

/// Scalar/vector binary operators, lowest to highest precedence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Or,
    And,
    Unless,
    CmpEq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Unless => "unless",
            BinaryOp::CmpEq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
        }
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::Or | BinaryOp::And | BinaryOp::Unless)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::CmpEq
                | BinaryOp::Neq
                | BinaryOp::Gt
                | BinaryOp::Gte
                | BinaryOp::Lt
                | BinaryOp::Lte
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cardinality side of a vector matching clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchCardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorMatching {
    pub on: bool,
    pub labels: Vec<String>,
    pub card: MatchCardinality,
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinOpModifier {
    pub return_bool: bool,
    pub matching: Option<VectorMatching>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinOpExpr {
    pub op: BinaryOp,
    pub lhs: Box<MetricExpr>,
    pub rhs: Box<MetricExpr>,
    pub modifier: BinOpModifier,
}

impl fmt::Display for BinOpExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {}", self.lhs, self.op)?;
        if self.modifier.return_bool {
            write!(f, " bool")?;
        }
        if let Some(matching) = &self.modifier.matching {
            let keyword = if matching.on { "on" } else { "ignoring" };
            write!(f, " {keyword} ({})", matching.labels.join(","))?;
            match matching.card {
                MatchCardinality::OneToOne => {}
                MatchCardinality::ManyToOne => write!(f, " group_left ({})", matching.include.join(","))?,
                MatchCardinality::OneToMany => write!(f, " group_right ({})", matching.include.join(","))?,
            }
        }
        write!(f, " {})", self.rhs)
    }
}

/// A metric (sample-producing) expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricExpr {
    RangeAgg(RangeAggExpr),
    VectorAgg(VectorAggExpr),
    BinOp(BinOpExpr),
    Literal(f64),
    Vector(f64),
}

impl fmt::Display for MetricExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricExpr::RangeAgg(expr) => write!(f, "{expr}"),
            MetricExpr::VectorAgg(expr) => write!(f, "{expr}"),
            MetricExpr::BinOp(expr) => write!(f, "{expr}"),
            MetricExpr::Literal(value) => write!(f, "{value}"),
            MetricExpr::Vector(value) => write!(f, "vector({value})"),
        }
    }
}

/// Any parsed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Log(LogExpr),
    Metric(MetricExpr),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Log(expr) => write!(f, "{expr}"),
            Expr::Metric(expr) => write!(f, "{expr}"),
        }
    }
}

/// A borrowed view of one tree node handed to `walk` visitors.
#[derive(Debug, Clone, Copy)]
pub enum ExprRef<'a> {
    Log(&'a LogExpr),
    Metric(&'a MetricExpr),
    Stage(&'a StageExpr),
}

impl Expr {
    /// Depth-first traversal over every log, metric, and stage node.
    pub fn walk(&self, f: &mut dyn FnMut(ExprRef<'_>)) {
        match self {
            Expr::Log(log) => walk_log(log, f),
            Expr::Metric(metric) => walk_metric(metric, f),
        }
    }

    /// All stream selectors referenced by the query.
    pub fn selectors(&self) -> Vec<&SelectorExpr> {
        fn collect<'a>(metric: &'a MetricExpr, out: &mut Vec<&'a SelectorExpr>) {
            match metric {
                MetricExpr::RangeAgg(agg) => out.push(agg.range.selector.selector()),
                MetricExpr::VectorAgg(agg) => collect(&agg.expr, out),
                MetricExpr::BinOp(binop) => {
                    collect(&binop.lhs, out);
                    collect(&binop.rhs, out);
                }
                MetricExpr::Literal(_) | MetricExpr::Vector(_) => {}
            }
        }
        match self {
            Expr::Log(log) => vec![log.selector()],
            Expr::Metric(metric) => {
                let mut out = Vec::new();
                collect(metric, &mut out);
                out
            }
        }
    }
}

fn walk_log(log: &LogExpr, f: &mut dyn FnMut(ExprRef<'_>)) {
    f(ExprRef::Log(log));
    for stage in log.stages() {
        f(ExprRef::Stage(stage));
    }
}

fn walk_metric(metric: &MetricExpr, f: &mut dyn FnMut(ExprRef<'_>)) {
    f(ExprRef::Metric(metric));
    match metric {
        MetricExpr::RangeAgg(agg) => walk_log(&agg.range.selector, f),
        MetricExpr::VectorAgg(agg) => walk_metric(&agg.expr, f),
        MetricExpr::BinOp(binop) => {
            walk_metric(&binop.lhs, f);
            walk_metric(&binop.rhs, f);
        }
        MetricExpr::Literal(_) | MetricExpr::Vector(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_filter(ty: LineMatchType, text: &str) -> LineFilterExpr {
        LineFilterExpr::new(ty, text.to_string(), None)
    }

    #[test]
    fn test_selector_display() {
        let selector = SelectorExpr {
            matchers: vec![
                LabelMatcher::new("app", MatchOp::Eq, "api"),
                LabelMatcher::new("env", MatchOp::NotRe, "dev.*"),
            ],
        };
        assert_eq!(selector.to_string(), r#"{app="api", env!~"dev.*"}"#);
    }

    #[test]
    fn test_or_chain_display_omits_repeated_type() {
        let chained = new_or_line_filter(
            line_filter(LineMatchType::Equal, "foo"),
            line_filter(LineMatchType::Equal, "bar"),
        );
        assert_eq!(chained.to_string(), r#"|= "foo" or "bar""#);
    }

    #[test]
    fn test_negative_or_chain_flattens() {
        let chained = new_or_line_filter(
            line_filter(LineMatchType::NotEqual, "foo"),
            new_or_line_filter(
                line_filter(LineMatchType::Equal, "bar"),
                line_filter(LineMatchType::Equal, "baz"),
            ),
        );
        // not (foo or bar or baz) renders as a chain of negations.
        assert_eq!(chained.to_string(), r#"!= "foo" != "bar" != "baz""#);
        assert!(chained.or.is_none());
        assert_eq!(chained.filter.ty, LineMatchType::NotEqual);
    }

    #[test]
    fn test_reorder_hoists_line_filters() {
        let stages = vec![
            StageExpr::Json {
                expressions: vec![],
            },
            StageExpr::LineFilter(line_filter(LineMatchType::Equal, "err")),
        ];
        let reordered = reorder_stages(stages);
        assert!(matches!(reordered[0], StageExpr::LineFilter(_)));
        assert!(matches!(reordered[1], StageExpr::Json { .. }));
    }

    #[test]
    fn test_reorder_respects_line_format_barrier() {
        let stages = vec![
            StageExpr::Json {
                expressions: vec![],
            },
            StageExpr::LineFormat {
                template: "{{.msg}}".to_string(),
            },
            StageExpr::LineFilter(line_filter(LineMatchType::Equal, "err")),
        ];
        let reordered = reorder_stages(stages);
        assert!(matches!(reordered[0], StageExpr::Json { .. }));
        assert!(matches!(reordered[1], StageExpr::LineFormat { .. }));
        assert!(matches!(reordered[2], StageExpr::LineFilter(_)));
    }

    #[test]
    fn test_reorder_merges_consecutive_filters() {
        let stages = vec![
            StageExpr::LineFilter(line_filter(LineMatchType::Equal, "a")),
            StageExpr::LineFilter(line_filter(LineMatchType::Equal, "b")),
            StageExpr::Json {
                expressions: vec![],
            },
        ];
        let reordered = reorder_stages(stages);
        assert_eq!(reordered.len(), 2);
        match &reordered[0] {
            StageExpr::LineFilter(combined) => {
                assert_eq!(combined.filter.match_text, "b");
                assert_eq!(
                    combined.left.as_ref().unwrap().filter.match_text,
                    "a"
                );
            }
            other => panic!("expected combined line filter, got {other:?}"),
        }
    }

    #[test]
    fn test_label_filter_barrier_flushes_in_order() {
        let stages = vec![
            StageExpr::Json {
                expressions: vec![],
            },
            StageExpr::LabelFilter(LabelFilterExpr::Matcher(LabelMatcher::new(
                "level",
                MatchOp::Eq,
                "err",
            ))),
            StageExpr::LineFilter(line_filter(LineMatchType::Equal, "x")),
        ];
        let reordered = reorder_stages(stages);
        assert!(matches!(reordered[0], StageExpr::Json { .. }));
        assert!(matches!(reordered[1], StageExpr::LabelFilter(_)));
        assert!(matches!(reordered[2], StageExpr::LineFilter(_)));
    }

    #[test]
    fn test_matches_empty() {
        assert!(LabelMatcher::new("a", MatchOp::Re, ".*").matches_empty());
        assert!(!LabelMatcher::new("a", MatchOp::Re, ".+").matches_empty());
        assert!(LabelMatcher::new("a", MatchOp::Eq, "").matches_empty());
        assert!(!LabelMatcher::new("a", MatchOp::Eq, "x").matches_empty());
        assert!(LabelMatcher::new("a", MatchOp::Neq, "x").matches_empty());
    }

    #[test]
    fn test_serde_round_trip() {
        let expr = Expr::Metric(MetricExpr::RangeAgg(RangeAggExpr {
            op: RangeOp::Rate,
            range: LogRangeExpr {
                selector: LogExpr::Pipeline(PipelineExpr {
                    selector: SelectorExpr {
                        matchers: vec![LabelMatcher::new("app", MatchOp::Eq, "api")],
                    },
                    stages: vec![StageExpr::Json {
                        expressions: vec![],
                    }],
                }),
                interval: Duration::from_secs(300),
                offset: Duration::ZERO,
                unwrap: None,
            },
            param: None,
            grouping: None,
        }));
        let encoded = serde_json::to_string(&expr).unwrap();
        let decoded: Expr = serde_json::from_str(&encoded).unwrap();
        assert_eq!(expr, decoded);
    }

    #[test]
    fn test_walk_visits_nested_nodes() {
        let expr = Expr::Metric(MetricExpr::VectorAgg(VectorAggExpr {
            op: VectorOp::Sum,
            expr: Box::new(MetricExpr::RangeAgg(RangeAggExpr {
                op: RangeOp::CountOverTime,
                range: LogRangeExpr {
                    selector: LogExpr::Selector(SelectorExpr {
                        matchers: vec![LabelMatcher::new("app", MatchOp::Eq, "api")],
                    }),
                    interval: Duration::from_secs(60),
                    offset: Duration::ZERO,
                    unwrap: None,
                },
                param: None,
                grouping: None,
            })),
            param: None,
            grouping: Grouping {
                groups: vec!["app".to_string()],
                without: false,
            },
        }));
        let mut metrics = 0;
        let mut logs = 0;
        expr.walk(&mut |node| match node {
            ExprRef::Metric(_) => metrics += 1,
            ExprRef::Log(_) => logs += 1,
            ExprRef::Stage(_) => {}
        });
        assert_eq!(metrics, 2);
        assert_eq!(logs, 1);
        assert_eq!(expr.selectors().len(), 1);
    }
}
