//! Recursive-descent parser over the token stream.

use std::time::Duration;

use crate::pipeline::format::LineTemplate;
use crate::pipeline::label_filter::IpMatcher;
use crate::pipeline::labels::{ERROR_DETAILS_LABEL, ERROR_LABEL};
use crate::pipeline::parsers::{JsonPath, PatternMatcher, RegexpParser};

use super::ast::*;
use super::lexer::{SpannedToken, Token};
use super::ParseError;

pub struct Parser {
    tokens: Vec<SpannedToken>,
    position: usize,
}

impl Parser {
    pub fn new(tokens: Vec<SpannedToken>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Expr, ParseError> {
        let expr = if self.check(&Token::OpenBrace) {
            Expr::Log(self.parse_log_expr()?)
        } else {
            Expr::Metric(self.parse_metric_expr(0)?)
        };
        if !self.check(&Token::Eof) {
            return Err(self.error_here(format!(
                "unexpected {} after complete expression",
                describe(self.token())
            )));
        }
        Ok(expr)
    }

    fn token(&self) -> &Token {
        &self.tokens[self.position.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.position + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn bump(&mut self) -> Token {
        let token = self.token().clone();
        if self.position + 1 < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.token()) == std::mem::discriminant(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_identifier(&mut self, word: &str) -> bool {
        if matches!(self.token(), Token::Identifier(w) if w == word) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ParseError> {
        if self.check(&token) {
            self.bump();
            Ok(())
        } else {
            Err(self.error_here(format!(
                "expected {}, got {}",
                describe(&token),
                describe(self.token())
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match self.bump() {
            Token::Identifier(name) => Ok(name),
            other => Err(self.error_here(format!(
                "expected identifier, got {}",
                describe(&other)
            ))),
        }
    }

    fn expect_string(&mut self) -> Result<String, ParseError> {
        match self.bump() {
            Token::String(value) => Ok(value),
            other => Err(self.error_here(format!(
                "expected string literal, got {}",
                describe(&other)
            ))),
        }
    }

    fn expect_duration(&mut self) -> Result<Duration, ParseError> {
        match self.bump() {
            Token::Duration(duration) => Ok(duration),
            other => Err(self.error_here(format!(
                "expected duration, got {}",
                describe(&other)
            ))),
        }
    }

    fn error_here(&self, msg: impl Into<String>) -> ParseError {
        let spanned = &self.tokens[self.position.min(self.tokens.len() - 1)];
        ParseError {
            msg: msg.into(),
            line: spanned.line,
            column: spanned.column,
        }
    }

    // ----- log expressions -----

    fn parse_log_expr(&mut self) -> Result<LogExpr, ParseError> {
        let selector = self.parse_selector()?;
        let (stages, unwrap) = self.parse_stages(false)?;
        debug_assert!(unwrap.is_none(), "unwrap rejected outside range context");
        if stages.is_empty() {
            Ok(LogExpr::Selector(selector))
        } else {
            Ok(LogExpr::Pipeline(PipelineExpr { selector, stages }))
        }
    }

    fn parse_selector(&mut self) -> Result<SelectorExpr, ParseError> {
        self.expect(Token::OpenBrace)?;
        let mut matchers = Vec::new();
        if !self.check(&Token::CloseBrace) {
            loop {
                matchers.push(self.parse_matcher()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::CloseBrace)?;
        Ok(SelectorExpr { matchers })
    }

    fn parse_matcher(&mut self) -> Result<LabelMatcher, ParseError> {
        let name = self.expect_identifier()?;
        let op = match self.bump() {
            Token::Eq => MatchOp::Eq,
            Token::Neq => MatchOp::Neq,
            Token::Re => MatchOp::Re,
            Token::NotRe => MatchOp::NotRe,
            other => {
                return Err(self.error_here(format!(
                    "expected matcher operator, got {}",
                    describe(&other)
                )))
            }
        };
        let value = self.expect_string()?;
        if matches!(op, MatchOp::Re | MatchOp::NotRe) {
            regex::Regex::new(&format!("^(?:{value})$"))
                .map_err(|err| self.error_here(format!("invalid regex in matcher: {err}")))?;
        }
        Ok(LabelMatcher { name, op, value })
    }

    /// Parses the pipe-delimited stage chain. In range context an `unwrap`
    /// stage is accepted and subsequent pipes attach to it as post
    /// filters.
    fn parse_stages(
        &mut self,
        range_context: bool,
    ) -> Result<(Vec<StageExpr>, Option<UnwrapExpr>), ParseError> {
        let mut stages = Vec::new();
        let mut unwrap: Option<UnwrapExpr> = None;
        loop {
            let line_filter_ty = match self.token() {
                Token::PipeExact => Some(LineMatchType::Equal),
                Token::Neq => Some(LineMatchType::NotEqual),
                Token::PipeMatch => Some(LineMatchType::Regexp),
                Token::NotRe => Some(LineMatchType::NotRegexp),
                Token::PipePattern => Some(LineMatchType::Pattern),
                Token::NotPattern => Some(LineMatchType::NotPattern),
                Token::Pipe => None,
                _ => break,
            };
            match line_filter_ty {
                Some(ty) => {
                    if unwrap.is_some() {
                        return Err(
                            self.error_here("only label filters may follow an unwrap expression")
                        );
                    }
                    self.bump();
                    stages.push(StageExpr::LineFilter(self.parse_line_filter(ty)?));
                }
                None => {
                    self.bump();
                    if let Some(unwrap) = unwrap.as_mut() {
                        unwrap.post_filters.push(self.parse_label_filter()?);
                        continue;
                    }
                    if self.eat_identifier("unwrap") {
                        if !range_context {
                            return Err(self.error_here(
                                "unwrap is only valid inside a range aggregation",
                            ));
                        }
                        unwrap = Some(self.parse_unwrap()?);
                        continue;
                    }
                    stages.push(self.parse_pipe_stage()?);
                }
            }
        }
        Ok((stages, unwrap))
    }

    fn parse_line_filter(&mut self, ty: LineMatchType) -> Result<LineFilterExpr, ParseError> {
        let mut operands = vec![self.parse_filter_operand(ty)?];
        while self.eat(&Token::Or) {
            operands.push(self.parse_filter_operand(ty)?);
        }
        // Or-chains accumulate right to left so the left-most match type
        // can be propagated down the chain.
        let mut chained = operands.pop().expect("at least one operand");
        while let Some(previous) = operands.pop() {
            chained = new_or_line_filter(previous, chained);
        }
        Ok(chained)
    }

    fn parse_filter_operand(&mut self, ty: LineMatchType) -> Result<LineFilterExpr, ParseError> {
        if self.eat_identifier(LINE_FILTER_OP_IP) {
            if !matches!(ty, LineMatchType::Equal | LineMatchType::NotEqual) {
                return Err(self.error_here("ip() line filters require |= or != matching"));
            }
            self.expect(Token::OpenParen)?;
            let pattern = self.expect_string()?;
            IpMatcher::parse(&pattern)
                .map_err(|err| self.error_here(format!("invalid ip filter: {err}")))?;
            self.expect(Token::CloseParen)?;
            return Ok(LineFilterExpr::new(
                ty,
                pattern,
                Some(LINE_FILTER_OP_IP.to_string()),
            ));
        }
        let match_text = self.expect_string()?;
        if matches!(ty, LineMatchType::Regexp | LineMatchType::NotRegexp) {
            regex::Regex::new(&match_text)
                .map_err(|err| self.error_here(format!("invalid regex in line filter: {err}")))?;
        }
        Ok(LineFilterExpr::new(ty, match_text, None))
    }

    fn parse_unwrap(&mut self) -> Result<UnwrapExpr, ParseError> {
        let first = self.expect_identifier()?;
        let (identifier, conversion) = match first.as_str() {
            "bytes" | "duration" | "duration_seconds" if self.check(&Token::OpenParen) => {
                self.bump();
                let identifier = self.expect_identifier()?;
                self.expect(Token::CloseParen)?;
                let conversion = match first.as_str() {
                    "bytes" => UnwrapConversion::Bytes,
                    "duration" => UnwrapConversion::Duration,
                    _ => UnwrapConversion::DurationSeconds,
                };
                (identifier, Some(conversion))
            }
            _ => (first, None),
        };
        Ok(UnwrapExpr {
            identifier,
            conversion,
            post_filters: Vec::new(),
        })
    }

    fn parse_pipe_stage(&mut self) -> Result<StageExpr, ParseError> {
        let word = match self.token() {
            Token::Identifier(word) => word.clone(),
            // Parenthesized or literal-first label filters:
            // `| (a="1" or b="2")`, `| 5.2 <= duration`.
            Token::OpenParen | Token::Number(_) | Token::Duration(_) | Token::Bytes(_) => {
                return Ok(StageExpr::LabelFilter(self.parse_label_filter()?))
            }
            other => {
                return Err(self.error_here(format!(
                    "expected pipeline stage, got {}",
                    describe(other)
                )))
            }
        };
        match word.as_str() {
            "json" => {
                self.bump();
                let expressions = self.parse_extraction_exprs()?;
                for expression in &expressions {
                    JsonPath::parse(&expression.expression)
                        .map_err(|err| self.error_here(err.to_string()))?;
                }
                Ok(StageExpr::Json { expressions })
            }
            "logfmt" => {
                self.bump();
                let mut strict = false;
                let mut keep_empty = false;
                while let Token::ParserFlag(flag) = self.token().clone() {
                    match flag.as_str() {
                        "--strict" => strict = true,
                        "--keep-empty" => keep_empty = true,
                        other => {
                            return Err(self
                                .error_here(format!("unknown logfmt flag {other}")))
                        }
                    }
                    self.bump();
                }
                let expressions = self.parse_extraction_exprs()?;
                Ok(StageExpr::Logfmt {
                    strict,
                    keep_empty,
                    expressions,
                })
            }
            "regexp" => {
                self.bump();
                let pattern = self.expect_string()?;
                RegexpParser::new(&pattern)
                    .map_err(|err| self.error_here(format!("invalid regexp parser: {err}")))?;
                Ok(StageExpr::Regexp { pattern })
            }
            "pattern" => {
                self.bump();
                let pattern = self.expect_string()?;
                PatternMatcher::new(&pattern)
                    .map_err(|err| self.error_here(format!("invalid pattern parser: {err}")))?;
                Ok(StageExpr::Pattern { pattern })
            }
            "unpack" => {
                self.bump();
                Ok(StageExpr::Unpack)
            }
            "decolorize" => {
                self.bump();
                Ok(StageExpr::Decolorize)
            }
            "line_format" => {
                self.bump();
                let template = self.expect_string()?;
                LineTemplate::compile(&template)
                    .map_err(|err| self.error_here(err.to_string()))?;
                Ok(StageExpr::LineFormat { template })
            }
            "label_format" => {
                self.bump();
                let mut formats: Vec<LabelFmtExpr> = Vec::new();
                loop {
                    let target = self.expect_identifier()?;
                    if target == ERROR_LABEL || target == ERROR_DETAILS_LABEL {
                        return Err(self.error_here(format!(
                            "cannot rename or assign the reserved label {target}"
                        )));
                    }
                    if formats.iter().any(|f| f.target == target) {
                        return Err(self
                            .error_here(format!("duplicate label_format target {target}")));
                    }
                    self.expect(Token::Eq)?;
                    let format = match self.bump() {
                        Token::Identifier(source) => LabelFmtExpr {
                            target,
                            value: source,
                            rename: true,
                        },
                        Token::String(template) => {
                            LineTemplate::compile(&template)
                                .map_err(|err| self.error_here(err.to_string()))?;
                            LabelFmtExpr {
                                target,
                                value: template,
                                rename: false,
                            }
                        }
                        other => {
                            return Err(self.error_here(format!(
                                "expected label name or template, got {}",
                                describe(&other)
                            )))
                        }
                    };
                    formats.push(format);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                Ok(StageExpr::LabelFormat { formats })
            }
            "drop" => {
                self.bump();
                Ok(StageExpr::DropLabels {
                    labels: self.parse_drop_labels()?,
                })
            }
            "keep" => {
                self.bump();
                Ok(StageExpr::KeepLabels {
                    labels: self.parse_drop_labels()?,
                })
            }
            _ => Ok(StageExpr::LabelFilter(self.parse_label_filter()?)),
        }
    }

    fn parse_extraction_exprs(&mut self) -> Result<Vec<ExtractionExpr>, ParseError> {
        let mut expressions = Vec::new();
        while matches!(self.token(), Token::Identifier(_)) {
            let label = self.expect_identifier()?;
            let expression = if self.eat(&Token::Eq) {
                self.expect_string()?
            } else {
                label.clone()
            };
            expressions.push(ExtractionExpr { label, expression });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(expressions)
    }

    fn parse_drop_labels(&mut self) -> Result<Vec<DropLabel>, ParseError> {
        let mut labels = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            let op = match self.token() {
                Token::Eq => Some(MatchOp::Eq),
                Token::Neq => Some(MatchOp::Neq),
                Token::Re => Some(MatchOp::Re),
                Token::NotRe => Some(MatchOp::NotRe),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.bump();
                    let value = self.expect_string()?;
                    labels.push(DropLabel::Matcher(LabelMatcher { name, op, value }));
                }
                None => labels.push(DropLabel::Name(name)),
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(labels)
    }

    // ----- label filter predicates -----

    fn parse_label_filter(&mut self) -> Result<LabelFilterExpr, ParseError> {
        self.parse_label_filter_or()
    }

    fn parse_label_filter_or(&mut self) -> Result<LabelFilterExpr, ParseError> {
        let mut left = self.parse_label_filter_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_label_filter_and()?;
            left = LabelFilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_label_filter_and(&mut self) -> Result<LabelFilterExpr, ParseError> {
        let mut left = self.parse_label_filter_primary()?;
        loop {
            // A comma between predicates reads as AND.
            if self.eat(&Token::And) || self.eat(&Token::Comma) {
                let right = self.parse_label_filter_primary()?;
                left = LabelFilterExpr::And(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_label_filter_primary(&mut self) -> Result<LabelFilterExpr, ParseError> {
        if self.eat(&Token::OpenParen) {
            let inner = self.parse_label_filter_or()?;
            self.expect(Token::CloseParen)?;
            return Ok(inner);
        }
        // Literal-first comparisons flip into name-first form.
        match self.token().clone() {
            Token::Number(value) => {
                self.bump();
                let op = self.parse_comparison_op()?.flipped();
                let name = self.expect_identifier()?;
                return Ok(LabelFilterExpr::Numeric { name, op, value });
            }
            Token::Duration(value) => {
                self.bump();
                let op = self.parse_comparison_op()?.flipped();
                let name = self.expect_identifier()?;
                return Ok(LabelFilterExpr::Duration { name, op, value });
            }
            Token::Bytes(value) => {
                self.bump();
                let op = self.parse_comparison_op()?.flipped();
                let name = self.expect_identifier()?;
                return Ok(LabelFilterExpr::Bytes { name, op, value });
            }
            _ => {}
        }

        let name = self.expect_identifier()?;
        match self.bump() {
            Token::Eq | Token::CmpEq => self.parse_filter_value(name, ComparisonOp::Eq, false),
            Token::Neq => self.parse_filter_value(name, ComparisonOp::Neq, true),
            Token::Re => {
                let value = self.expect_string()?;
                regex::Regex::new(&format!("^(?:{value})$"))
                    .map_err(|err| self.error_here(format!("invalid regex in label filter: {err}")))?;
                Ok(LabelFilterExpr::Matcher(LabelMatcher {
                    name,
                    op: MatchOp::Re,
                    value,
                }))
            }
            Token::NotRe => {
                let value = self.expect_string()?;
                regex::Regex::new(&format!("^(?:{value})$"))
                    .map_err(|err| self.error_here(format!("invalid regex in label filter: {err}")))?;
                Ok(LabelFilterExpr::Matcher(LabelMatcher {
                    name,
                    op: MatchOp::NotRe,
                    value,
                }))
            }
            Token::Gt => self.parse_unit_value(name, ComparisonOp::Gt),
            Token::Gte => self.parse_unit_value(name, ComparisonOp::Gte),
            Token::Lt => self.parse_unit_value(name, ComparisonOp::Lt),
            Token::Lte => self.parse_unit_value(name, ComparisonOp::Lte),
            other => Err(self.error_here(format!(
                "expected label filter operator, got {}",
                describe(&other)
            ))),
        }
    }

    /// Value side of `=`/`!=`: a string matcher, a unit comparison, or an
    /// `ip(...)` membership test.
    fn parse_filter_value(
        &mut self,
        name: String,
        op: ComparisonOp,
        negated: bool,
    ) -> Result<LabelFilterExpr, ParseError> {
        if self.eat_identifier(LINE_FILTER_OP_IP) {
            self.expect(Token::OpenParen)?;
            let pattern = self.expect_string()?;
            IpMatcher::parse(&pattern)
                .map_err(|err| self.error_here(format!("invalid ip filter: {err}")))?;
            self.expect(Token::CloseParen)?;
            return Ok(LabelFilterExpr::Ip {
                name,
                negated,
                pattern,
            });
        }
        match self.bump() {
            Token::String(value) => Ok(LabelFilterExpr::Matcher(LabelMatcher {
                name,
                op: if negated { MatchOp::Neq } else { MatchOp::Eq },
                value,
            })),
            Token::Number(value) => Ok(LabelFilterExpr::Numeric { name, op, value }),
            Token::Duration(value) => Ok(LabelFilterExpr::Duration { name, op, value }),
            Token::Bytes(value) => Ok(LabelFilterExpr::Bytes { name, op, value }),
            other => Err(self.error_here(format!(
                "expected label filter value, got {}",
                describe(&other)
            ))),
        }
    }

    fn parse_unit_value(
        &mut self,
        name: String,
        op: ComparisonOp,
    ) -> Result<LabelFilterExpr, ParseError> {
        match self.bump() {
            Token::Number(value) => Ok(LabelFilterExpr::Numeric { name, op, value }),
            Token::Duration(value) => Ok(LabelFilterExpr::Duration { name, op, value }),
            Token::Bytes(value) => Ok(LabelFilterExpr::Bytes { name, op, value }),
            other => Err(self.error_here(format!(
                "expected number, duration, or byte size, got {}",
                describe(&other)
            ))),
        }
    }

    fn parse_comparison_op(&mut self) -> Result<ComparisonOp, ParseError> {
        match self.bump() {
            Token::Eq | Token::CmpEq => Ok(ComparisonOp::Eq),
            Token::Neq => Ok(ComparisonOp::Neq),
            Token::Gt => Ok(ComparisonOp::Gt),
            Token::Gte => Ok(ComparisonOp::Gte),
            Token::Lt => Ok(ComparisonOp::Lt),
            Token::Lte => Ok(ComparisonOp::Lte),
            other => Err(self.error_here(format!(
                "expected comparison operator, got {}",
                describe(&other)
            ))),
        }
    }

    // ----- metric expressions -----

    fn parse_metric_expr(&mut self, min_prec: u8) -> Result<MetricExpr, ParseError> {
        let mut left = self.parse_metric_primary()?;
        loop {
            let Some((op, prec, right_assoc)) = binary_op_of(self.token()) else {
                return Ok(left);
            };
            if prec < min_prec {
                return Ok(left);
            }
            self.bump();
            let modifier = self.parse_binop_modifier(op)?;
            let next_min = if right_assoc { prec } else { prec + 1 };
            let right = self.parse_metric_expr(next_min)?;
            left = self.make_binop(op, left, right, modifier)?;
        }
    }

    fn parse_binop_modifier(&mut self, op: BinaryOp) -> Result<BinOpModifier, ParseError> {
        let mut modifier = BinOpModifier::default();
        if self.eat_identifier("bool") {
            if !op.is_comparison() {
                return Err(
                    self.error_here(format!("bool modifier is invalid for operation {op}"))
                );
            }
            modifier.return_bool = true;
        }
        let on = if self.eat_identifier("on") {
            true
        } else if self.eat_identifier("ignoring") {
            false
        } else {
            return Ok(modifier);
        };
        self.expect(Token::OpenParen)?;
        let mut labels = Vec::new();
        if !self.check(&Token::CloseParen) {
            loop {
                labels.push(self.expect_identifier()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::CloseParen)?;
        let mut matching = VectorMatching {
            on,
            labels,
            card: MatchCardinality::OneToOne,
            include: Vec::new(),
        };
        if self.eat_identifier("group_left") {
            matching.card = MatchCardinality::ManyToOne;
            matching.include = self.parse_optional_label_list()?;
        } else if self.eat_identifier("group_right") {
            matching.card = MatchCardinality::OneToMany;
            matching.include = self.parse_optional_label_list()?;
        }
        modifier.matching = Some(matching);
        Ok(modifier)
    }

    fn parse_optional_label_list(&mut self) -> Result<Vec<String>, ParseError> {
        if !self.eat(&Token::OpenParen) {
            return Ok(Vec::new());
        }
        let mut labels = Vec::new();
        if !self.check(&Token::CloseParen) {
            loop {
                labels.push(self.expect_identifier()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::CloseParen)?;
        Ok(labels)
    }

    fn make_binop(
        &self,
        op: BinaryOp,
        lhs: MetricExpr,
        rhs: MetricExpr,
        modifier: BinOpModifier,
    ) -> Result<MetricExpr, ParseError> {
        let lhs_literal = matches!(lhs, MetricExpr::Literal(_));
        let rhs_literal = matches!(rhs, MetricExpr::Literal(_));
        if op.is_logical() && (lhs_literal || rhs_literal) {
            return Err(self.error_here(format!(
                "unexpected literal for leg of logical/set binary operation {op}"
            )));
        }
        // Two literal legs fold at parse time.
        if let (MetricExpr::Literal(left), MetricExpr::Literal(right)) = (&lhs, &rhs) {
            return Ok(MetricExpr::Literal(fold_literals(op, *left, *right)));
        }
        Ok(MetricExpr::BinOp(BinOpExpr {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            modifier,
        }))
    }

    fn parse_metric_primary(&mut self) -> Result<MetricExpr, ParseError> {
        match self.token().clone() {
            Token::Number(value) => {
                self.bump();
                Ok(MetricExpr::Literal(value))
            }
            Token::Sub => {
                self.bump();
                match self.bump() {
                    Token::Number(value) => Ok(MetricExpr::Literal(-value)),
                    other => Err(self.error_here(format!(
                        "expected number after unary minus, got {}",
                        describe(&other)
                    ))),
                }
            }
            Token::Add => {
                self.bump();
                match self.bump() {
                    Token::Number(value) => Ok(MetricExpr::Literal(value)),
                    other => Err(self.error_here(format!(
                        "expected number after unary plus, got {}",
                        describe(&other)
                    ))),
                }
            }
            Token::OpenParen => {
                self.bump();
                let inner = self.parse_metric_expr(0)?;
                self.expect(Token::CloseParen)?;
                Ok(inner)
            }
            Token::Function(name) => self.parse_function(&name),
            Token::OpenBrace => Err(self.error_here(
                "log selector is not a metric expression; wrap it in a range aggregation",
            )),
            other => Err(self.error_here(format!(
                "unexpected {} in metric expression",
                describe(&other)
            ))),
        }
    }

    fn parse_function(&mut self, name: &str) -> Result<MetricExpr, ParseError> {
        self.bump();
        if name == "vector" {
            self.expect(Token::OpenParen)?;
            let value = match self.bump() {
                Token::Number(value) => value,
                other => {
                    return Err(self.error_here(format!(
                        "expected scalar in vector(), got {}",
                        describe(&other)
                    )))
                }
            };
            self.expect(Token::CloseParen)?;
            return Ok(MetricExpr::Vector(value));
        }
        if let Some(op) = VectorOp::from_name(name) {
            return self.parse_vector_agg(op);
        }
        if let Some(op) = RangeOp::from_name(name) {
            return self.parse_range_agg(op);
        }
        Err(self.error_here(format!("unknown function {name}")))
    }

    fn parse_vector_agg(&mut self, op: VectorOp) -> Result<MetricExpr, ParseError> {
        let mut grouping = None;
        if self.check(&Token::By) || self.check(&Token::Without) {
            grouping = Some(self.parse_grouping()?);
        }
        self.expect(Token::OpenParen)?;
        let mut param = None;
        if op.requires_param() {
            match self.bump() {
                Token::Number(value) if value > 0.0 && value.fract() == 0.0 => {
                    param = Some(value as u64);
                }
                other => {
                    return Err(self.error_here(format!(
                        "invalid parameter for operation {} (must be an integer greater than 0), got {}",
                        op.as_str(),
                        describe(&other)
                    )))
                }
            }
            self.expect(Token::Comma)?;
        } else if matches!(self.token(), Token::Number(_))
            && matches!(self.peek_at(1), Token::Comma)
        {
            return Err(self.error_here(format!(
                "unsupported parameter for operation {}",
                op.as_str()
            )));
        }
        let inner = self.parse_metric_expr(0)?;
        self.expect(Token::CloseParen)?;
        if grouping.is_none() && (self.check(&Token::By) || self.check(&Token::Without)) {
            grouping = Some(self.parse_grouping()?);
        }
        Ok(MetricExpr::VectorAgg(VectorAggExpr {
            op,
            expr: Box::new(inner),
            param,
            grouping: grouping.unwrap_or(Grouping {
                groups: Vec::new(),
                without: false,
            }),
        }))
    }

    fn parse_range_agg(&mut self, op: RangeOp) -> Result<MetricExpr, ParseError> {
        self.expect(Token::OpenParen)?;
        let mut param = None;
        if matches!(self.token(), Token::Number(_)) && matches!(self.peek_at(1), Token::Comma) {
            if let Token::Number(value) = self.bump() {
                param = Some(value);
            }
            self.bump(); // comma
        }
        let range = self.parse_log_range()?;
        self.expect(Token::CloseParen)?;
        let grouping = if self.check(&Token::By) || self.check(&Token::Without) {
            Some(self.parse_grouping()?)
        } else {
            None
        };
        let expr = RangeAggExpr {
            op,
            range,
            param,
            grouping,
        };
        expr.validate().map_err(|msg| self.error_here(msg))?;
        Ok(MetricExpr::RangeAgg(expr))
    }

    fn parse_log_range(&mut self) -> Result<LogRangeExpr, ParseError> {
        let selector = self.parse_selector()?;
        // The window may come straight after the selector or after the
        // pipeline stages.
        let mut window = None;
        if self.check(&Token::OpenBracket) {
            window = Some(self.parse_window()?);
        }
        let (stages, unwrap) = self.parse_stages(true)?;
        let (interval, offset) = match window {
            Some(window) => window,
            None => self.parse_window()?,
        };
        let selector = if stages.is_empty() {
            LogExpr::Selector(selector)
        } else {
            LogExpr::Pipeline(PipelineExpr { selector, stages })
        };
        Ok(LogRangeExpr {
            selector,
            interval,
            offset,
            unwrap,
        })
    }

    fn parse_window(&mut self) -> Result<(Duration, Duration), ParseError> {
        self.expect(Token::OpenBracket)?;
        let interval = self.expect_duration()?;
        self.expect(Token::CloseBracket)?;
        let mut offset = Duration::ZERO;
        if self.eat_identifier("offset") {
            offset = self.expect_duration()?;
        }
        Ok((interval, offset))
    }

    fn parse_grouping(&mut self) -> Result<Grouping, ParseError> {
        let without = match self.bump() {
            Token::By => false,
            Token::Without => true,
            other => {
                return Err(self.error_here(format!(
                    "expected by or without, got {}",
                    describe(&other)
                )))
            }
        };
        self.expect(Token::OpenParen)?;
        let mut groups = Vec::new();
        if !self.check(&Token::CloseParen) {
            loop {
                groups.push(self.expect_identifier()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::CloseParen)?;
        Ok(Grouping { groups, without })
    }
}

fn binary_op_of(token: &Token) -> Option<(BinaryOp, u8, bool)> {
    Some(match token {
        Token::Or => (BinaryOp::Or, 1, false),
        Token::And => (BinaryOp::And, 2, false),
        Token::Unless => (BinaryOp::Unless, 2, false),
        Token::CmpEq => (BinaryOp::CmpEq, 3, false),
        Token::Neq => (BinaryOp::Neq, 3, false),
        Token::Gt => (BinaryOp::Gt, 3, false),
        Token::Gte => (BinaryOp::Gte, 3, false),
        Token::Lt => (BinaryOp::Lt, 3, false),
        Token::Lte => (BinaryOp::Lte, 3, false),
        Token::Add => (BinaryOp::Add, 4, false),
        Token::Sub => (BinaryOp::Sub, 4, false),
        Token::Mul => (BinaryOp::Mul, 5, false),
        Token::Div => (BinaryOp::Div, 5, false),
        Token::Mod => (BinaryOp::Mod, 5, false),
        Token::Pow => (BinaryOp::Pow, 6, true),
        _ => return None,
    })
}

fn fold_literals(op: BinaryOp, left: f64, right: f64) -> f64 {
    let truth = |b: bool| if b { 1.0 } else { 0.0 };
    match op {
        BinaryOp::Add => left + right,
        BinaryOp::Sub => left - right,
        BinaryOp::Mul => left * right,
        BinaryOp::Div => {
            if right == 0.0 {
                f64::NAN
            } else {
                left / right
            }
        }
        BinaryOp::Mod => {
            if right == 0.0 {
                f64::NAN
            } else {
                left % right
            }
        }
        BinaryOp::Pow => left.powf(right),
        BinaryOp::CmpEq => truth(left == right),
        BinaryOp::Neq => truth(left != right),
        BinaryOp::Gt => truth(left > right),
        BinaryOp::Gte => truth(left >= right),
        BinaryOp::Lt => truth(left < right),
        BinaryOp::Lte => truth(left <= right),
        // Rejected before folding.
        BinaryOp::Or | BinaryOp::And | BinaryOp::Unless => f64::NAN,
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Identifier(name) => format!("identifier {name:?}"),
        Token::Function(name) => format!("function {name:?}"),
        Token::String(value) => format!("string {value:?}"),
        Token::Number(value) => format!("number {value}"),
        Token::Duration(value) => format!("duration {value:?}"),
        Token::Bytes(value) => format!("byte size {value}"),
        Token::ParserFlag(flag) => format!("flag {flag}"),
        Token::Eof => "end of input".to_string(),
        other => format!("{other:?}"),
    }
}
