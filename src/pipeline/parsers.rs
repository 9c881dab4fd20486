//! Label extraction stages: json, logfmt, regexp, pattern, and unpack.

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use super::labels::LabelsBuilder;

/// Error kind recorded when a line fails to parse as JSON.
pub const JSON_PARSER_ERROR: &str = "JSONParserErr";
/// Error kind recorded when a line fails strict logfmt decoding.
pub const LOGFMT_PARSER_ERROR: &str = "LogfmtParserErr";

/// Key whose value becomes the new line content in an unpack stage.
pub const UNPACK_ENTRY_KEY: &str = "_entry";

const MAX_INTERNED_KEYS: usize = 1024;

/// Extraction hints threaded through parser stages.
///
/// When an enclosing aggregation only needs a known set of labels, parsers
/// skip everything else and stop scanning once every required label has
/// been seen on the current line.
#[derive(Debug, Clone, Default)]
pub struct ParserHints {
    required: Option<Vec<String>>,
    extracted: Vec<String>,
    preserve_error: bool,
}

impl ParserHints {
    pub fn new(required: Vec<String>) -> Self {
        Self {
            required: Some(required),
            extracted: Vec::new(),
            preserve_error: false,
        }
    }

    /// Keeps the error detail label even when grouping would discard it.
    pub fn with_preserve_error(mut self) -> Self {
        self.preserve_error = true;
        self
    }

    pub fn preserve_error(&self) -> bool {
        self.preserve_error
    }

    pub fn should_extract(&self, name: &str) -> bool {
        match &self.required {
            None => true,
            Some(required) => required.iter().any(|r| r == name),
        }
    }

    /// Whether a nested object under `prefix` can still contribute a
    /// required label.
    pub fn should_expand_prefix(&self, prefix: &str) -> bool {
        match &self.required {
            None => true,
            Some(required) => required.iter().any(|r| r.starts_with(prefix)),
        }
    }

    /// True once every required label has been extracted on this line.
    pub fn all_extracted(&self) -> bool {
        match &self.required {
            None => false,
            Some(required) => self.extracted.len() >= required.len(),
        }
    }

    pub(crate) fn record_extracted(&mut self, name: &str) {
        let Some(required) = &self.required else {
            return;
        };
        if required.iter().any(|r| r == name) && !self.extracted.iter().any(|e| e == name) {
            self.extracted.push(name.to_string());
        }
    }

    pub(crate) fn reset_line(&mut self) {
        self.extracted.clear();
    }
}

/// Rewrites a raw key into a valid label name, or `None` when nothing
/// valid remains.
pub fn sanitize_label_name(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let mut name = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            name.push(ch);
        } else {
            name.push('_');
        }
    }
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    Some(name)
}

/// Bounded cache of raw-key to sanitized-name mappings, retained across
/// lines of one stream. Past the size cap names are computed uncached.
#[derive(Debug, Clone, Default)]
struct KeyInterner {
    map: HashMap<String, Option<String>>,
}

impl KeyInterner {
    fn sanitized(&mut self, raw: &str) -> Option<String> {
        if let Some(hit) = self.map.get(raw) {
            return hit.clone();
        }
        let computed = sanitize_label_name(raw);
        if self.map.len() < MAX_INTERNED_KEYS {
            self.map.insert(raw.to_string(), computed.clone());
        }
        computed
    }
}

/// Extracts every scalar field of a JSON line, flattening nested objects
/// with `_`-joined prefixes.
#[derive(Debug, Clone, Default)]
pub struct JsonParser {
    keys: KeyInterner,
    prefix_buf: String,
}

impl JsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, line: &str, lbs: &mut LabelsBuilder) -> bool {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                lbs.set_error(JSON_PARSER_ERROR, &err.to_string());
                return true;
            }
        };
        let Value::Object(map) = value else {
            lbs.set_error(JSON_PARSER_ERROR, "line is not a JSON object");
            return true;
        };
        self.prefix_buf.clear();
        self.extract_object(&map, lbs);
        true
    }

    fn extract_object(&mut self, map: &Map<String, Value>, lbs: &mut LabelsBuilder) {
        for (raw_key, value) in map {
            if lbs.parser_hints().all_extracted() {
                return;
            }
            let Some(key) = self.keys.sanitized(raw_key) else {
                continue;
            };
            match value {
                Value::Object(nested) => {
                    let saved = self.prefix_buf.len();
                    if !self.prefix_buf.is_empty() {
                        self.prefix_buf.push('_');
                    }
                    self.prefix_buf.push_str(&key);
                    if lbs.parser_hints().should_expand_prefix(&self.prefix_buf) {
                        self.extract_object(nested, lbs);
                    }
                    self.prefix_buf.truncate(saved);
                }
                Value::String(s) => self.add(&key, s, lbs),
                Value::Number(n) => self.add(&key, &n.to_string(), lbs),
                Value::Bool(b) => self.add(&key, if *b { "true" } else { "false" }, lbs),
                Value::Array(_) | Value::Null => {}
            }
        }
    }

    fn add(&mut self, key: &str, value: &str, lbs: &mut LabelsBuilder) {
        let name = if self.prefix_buf.is_empty() {
            key.to_string()
        } else {
            format!("{}_{}", self.prefix_buf, key)
        };
        if !lbs.parser_hints().should_extract(&name) {
            return;
        }
        lbs.add_extracted(&name, value);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("invalid label extraction expression: {0}")]
    Invalid(String),
}

/// One step of a JSON access path: an object field or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Field(String),
    Index(usize),
}

/// A parsed `a.b["key"][0]` access path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<PathSegment>,
}

impl JsonPath {
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let invalid = |msg: &str| ExpressionError::Invalid(format!("{msg} in {expression:?}"));
        let mut chars = expression.trim().chars().peekable();
        let mut segments = Vec::new();
        let mut current = String::new();
        while let Some(&ch) = chars.peek() {
            match ch {
                '.' => {
                    chars.next();
                    if !current.is_empty() {
                        segments.push(PathSegment::Field(std::mem::take(&mut current)));
                    }
                }
                '[' => {
                    if !current.is_empty() {
                        segments.push(PathSegment::Field(std::mem::take(&mut current)));
                    }
                    chars.next();
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        let mut field = String::new();
                        loop {
                            match chars.next() {
                                Some('"') => break,
                                Some('\\') => {
                                    if let Some(escaped) = chars.next() {
                                        field.push(escaped);
                                    }
                                }
                                Some(c) => field.push(c),
                                None => return Err(invalid("unterminated quoted field")),
                            }
                        }
                        if chars.next() != Some(']') {
                            return Err(invalid("missing closing `]`"));
                        }
                        if field.is_empty() {
                            return Err(invalid("empty field"));
                        }
                        segments.push(PathSegment::Field(field));
                    } else {
                        let mut digits = String::new();
                        while let Some(&digit) = chars.peek() {
                            if !digit.is_ascii_digit() {
                                break;
                            }
                            digits.push(digit);
                            chars.next();
                        }
                        if chars.next() != Some(']') {
                            return Err(invalid("missing closing `]`"));
                        }
                        let index = digits
                            .parse::<usize>()
                            .map_err(|_| invalid("invalid array index"))?;
                        segments.push(PathSegment::Index(index));
                    }
                }
                _ => {
                    current.push(ch);
                    chars.next();
                }
            }
        }
        if !current.is_empty() {
            segments.push(PathSegment::Field(current));
        }
        if segments.is_empty() {
            return Err(invalid("empty path"));
        }
        Ok(Self { segments })
    }

    fn evaluate<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match (segment, current) {
                (PathSegment::Field(key), Value::Object(map)) => map.get(key)?,
                (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Extracts only the configured paths from a JSON line.
#[derive(Debug, Clone)]
pub struct JsonExpressionParser {
    paths: Vec<(String, JsonPath)>,
}

impl JsonExpressionParser {
    pub fn new(expressions: &[(String, String)]) -> Result<Self, ExpressionError> {
        let mut paths = Vec::with_capacity(expressions.len());
        for (label, expression) in expressions {
            paths.push((label.clone(), JsonPath::parse(expression)?));
        }
        Ok(Self { paths })
    }

    pub fn process(&self, line: &str, lbs: &mut LabelsBuilder) -> bool {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                lbs.set_error(JSON_PARSER_ERROR, &err.to_string());
                return true;
            }
        };
        for (label, path) in &self.paths {
            if let Some(found) = path.evaluate(&value) {
                let rendered = match found {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                lbs.add_extracted(label, &rendered);
            }
        }
        true
    }
}

/// Linear key=value scanner.
#[derive(Debug, Clone, Default)]
pub struct LogfmtParser {
    strict: bool,
    keep_empty: bool,
    /// When non-empty, only the listed source keys are extracted, renamed
    /// to their target labels.
    expressions: Vec<(String, String)>,
    keys: KeyInterner,
}

impl LogfmtParser {
    pub fn new(strict: bool, keep_empty: bool, expressions: Vec<(String, String)>) -> Self {
        Self {
            strict,
            keep_empty,
            expressions,
            keys: KeyInterner::default(),
        }
    }

    pub fn process(&mut self, line: &str, lbs: &mut LabelsBuilder) -> bool {
        let mut rest = line;
        loop {
            rest = rest.trim_start();
            if rest.is_empty() || lbs.parser_hints().all_extracted() {
                return true;
            }
            match scan_pair(rest) {
                Ok((key, value, remaining)) => {
                    rest = remaining;
                    if key.is_empty() {
                        if self.strict {
                            lbs.set_error(LOGFMT_PARSER_ERROR, "logfmt entry has no key");
                            return true;
                        }
                        continue;
                    }
                    let Some(value) = value else {
                        // Malformed escape; the value is dropped.
                        continue;
                    };
                    if value.is_empty() && !self.keep_empty {
                        continue;
                    }
                    self.add(key, &value, lbs);
                }
                Err(err) => {
                    if self.strict {
                        lbs.set_error(LOGFMT_PARSER_ERROR, &err);
                        return true;
                    }
                    // Skip the malformed token and resume at whitespace.
                    match rest.find(char::is_whitespace) {
                        Some(pos) => rest = &rest[pos..],
                        None => return true,
                    }
                }
            }
        }
    }

    fn add(&mut self, raw_key: &str, value: &str, lbs: &mut LabelsBuilder) {
        if !self.expressions.is_empty() {
            for (target, source) in &self.expressions {
                if source == raw_key {
                    lbs.add_extracted(target, value);
                }
            }
            return;
        }
        let Some(key) = self.keys.sanitized(raw_key) else {
            return;
        };
        if !lbs.parser_hints().should_extract(&key) {
            return;
        }
        lbs.add_extracted(&key, value);
    }
}

/// Scans one key[=value] pair, returning the key, the decoded value
/// (`None` when its escapes are invalid), and the remaining input.
fn scan_pair(input: &str) -> Result<(&str, Option<String>, &str), String> {
    let key_end = input
        .find(|c: char| c == '=' || c.is_whitespace())
        .unwrap_or(input.len());
    let key = &input[..key_end];
    let rest = &input[key_end..];
    let Some(rest) = rest.strip_prefix('=') else {
        // Standalone key.
        return Ok((key, Some(String::new()), rest));
    };
    if let Some(quoted) = rest.strip_prefix('"') {
        let mut value = String::new();
        let mut valid = true;
        let mut chars = quoted.char_indices();
        loop {
            let Some((i, ch)) = chars.next() else {
                return Err(format!("unterminated quoted value for key {key:?}"));
            };
            match ch {
                '"' => return Ok((key, valid.then_some(value), &quoted[i + 1..])),
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, '\\')) => value.push('\\'),
                    Some(_) => valid = false,
                    None => return Err(format!("unterminated quoted value for key {key:?}")),
                },
                _ => value.push(ch),
            }
        }
    }
    let value_end = rest
        .find(char::is_whitespace)
        .unwrap_or(rest.len());
    Ok((
        key,
        Some(rest[..value_end].to_string()),
        &rest[value_end..],
    ))
}

#[derive(Debug, Error)]
pub enum RegexpParserError {
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("at least one named capture must be supplied")]
    NoNamedCaptures,
}

/// Binds the named captures of a pre-compiled regex to labels.
#[derive(Debug, Clone)]
pub struct RegexpParser {
    regex: Regex,
    names: Vec<String>,
}

impl RegexpParser {
    pub fn new(pattern: &str) -> Result<Self, RegexpParserError> {
        let regex = Regex::new(pattern)?;
        let names: Vec<String> = regex
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(RegexpParserError::NoNamedCaptures);
        }
        Ok(Self { regex, names })
    }

    pub fn process(&self, line: &str, lbs: &mut LabelsBuilder) -> bool {
        if let Some(captures) = self.regex.captures(line) {
            for name in &self.names {
                if !lbs.parser_hints().should_extract(name) {
                    continue;
                }
                if let Some(matched) = captures.name(name) {
                    lbs.add_extracted(name, matched.as_str());
                }
            }
        }
        true
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("at least one named capture must be supplied")]
    NoNamedCaptures,
    #[error("consecutive captures are ambiguous")]
    ConsecutiveCaptures,
    #[error("duplicate capture name: {0}")]
    DuplicateCapture(String),
    #[error("invalid pattern: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal(String),
    Capture(String),
    Wildcard,
}

/// A compiled `<capture>`/literal pattern, anchored at the start of the
/// line.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    tokens: Vec<PatternToken>,
}

impl PatternMatcher {
    /// Compiles a pattern for a parser stage; at least one named capture
    /// is required.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let matcher = Self::for_line_filter(pattern)?;
        if !matcher
            .tokens
            .iter()
            .any(|t| matches!(t, PatternToken::Capture(_)))
        {
            return Err(PatternError::NoNamedCaptures);
        }
        Ok(matcher)
    }

    /// Compiles a pattern for a `|>` line filter, where captures are
    /// allowed but not required.
    pub fn for_line_filter(pattern: &str) -> Result<Self, PatternError> {
        let tokens = parse_pattern(pattern);
        if tokens.is_empty() {
            return Err(PatternError::Invalid("empty pattern".to_string()));
        }
        let mut seen: Vec<&str> = Vec::new();
        let mut previous_was_capture = false;
        for token in &tokens {
            let is_capture = !matches!(token, PatternToken::Literal(_));
            if is_capture && previous_was_capture {
                return Err(PatternError::ConsecutiveCaptures);
            }
            previous_was_capture = is_capture;
            if let PatternToken::Capture(name) = token {
                if seen.contains(&name.as_str()) {
                    return Err(PatternError::DuplicateCapture(name.clone()));
                }
                seen.push(name);
            }
        }
        Ok(Self { tokens })
    }

    /// True when the pattern contains no literal anchors and so matches
    /// every line.
    pub fn is_trivial(&self) -> bool {
        !self
            .tokens
            .iter()
            .any(|t| matches!(t, PatternToken::Literal(_)))
    }

    pub fn matches(&self, line: &str) -> bool {
        self.run(line, |_, _| {})
    }

    fn run<'s, 'a>(&'s self, line: &'a str, mut on_capture: impl FnMut(&'s str, &'a str)) -> bool {
        let mut rest = line;
        let mut pending: Option<&PatternToken> = None;
        for token in &self.tokens {
            match token {
                PatternToken::Literal(lit) => match pending.take() {
                    None => match rest.strip_prefix(lit.as_str()) {
                        Some(after) => rest = after,
                        None => return false,
                    },
                    Some(capture) => match rest.find(lit.as_str()) {
                        Some(idx) => {
                            if let PatternToken::Capture(name) = capture {
                                on_capture(name, &rest[..idx]);
                            }
                            rest = &rest[idx + lit.len()..];
                        }
                        None => return false,
                    },
                },
                capture => pending = Some(capture),
            }
        }
        if let Some(PatternToken::Capture(name)) = pending {
            on_capture(name, rest);
        }
        true
    }
}

fn parse_pattern(pattern: &str) -> Vec<PatternToken> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        match after.find('>') {
            Some(close) if is_capture_name(&after[..close]) => {
                literal.push_str(&rest[..open]);
                if !literal.is_empty() {
                    tokens.push(PatternToken::Literal(std::mem::take(&mut literal)));
                }
                let name = &after[..close];
                if name == "_" {
                    tokens.push(PatternToken::Wildcard);
                } else {
                    tokens.push(PatternToken::Capture(name.to_string()));
                }
                rest = &after[close + 1..];
            }
            _ => {
                // Not a capture; `<` is ordinary text.
                literal.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        tokens.push(PatternToken::Literal(literal));
    }
    tokens
}

fn is_capture_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Parser stage binding pattern captures to labels.
#[derive(Debug, Clone)]
pub struct PatternParser {
    matcher: PatternMatcher,
}

impl PatternParser {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Ok(Self {
            matcher: PatternMatcher::new(pattern)?,
        })
    }

    pub fn process(&self, line: &str, lbs: &mut LabelsBuilder) -> bool {
        let mut captured: Vec<(&str, &str)> = Vec::new();
        if self.matcher.run(line, |name, value| captured.push((name, value))) {
            for (name, value) in captured {
                if lbs.parser_hints().should_extract(name) {
                    lbs.add_extracted(name, value);
                }
            }
        }
        true
    }
}

/// Treats the line as a JSON object, promoting the reserved entry key to
/// become the new line content and every other string value to a label.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackParser;

impl UnpackParser {
    pub fn new() -> Self {
        Self
    }

    /// Returns the replacement line when the entry key is present.
    pub fn process(&self, line: &str, lbs: &mut LabelsBuilder) -> Option<String> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                lbs.set_error(JSON_PARSER_ERROR, &err.to_string());
                return None;
            }
        };
        let Value::Object(map) = value else {
            lbs.set_error(JSON_PARSER_ERROR, "line is not a JSON object");
            return None;
        };
        let mut entry = None;
        for (key, value) in map {
            let Value::String(text) = value else {
                continue;
            };
            if key == UNPACK_ENTRY_KEY {
                entry = Some(text);
            } else {
                lbs.add_extracted(&key, &text);
            }
        }
        entry
    }
}
