//! Line-content filters.
//!
//! A compiled query keeps one filter tree per group of line filter stages.
//! The tree is built from the left-linked AND chain produced by the parser,
//! with `or` side-chains for alternation inside a single clause.

use regex::Regex;
use thiserror::Error;

use crate::query::ast::{LineFilter as LineFilterSpec, LineFilterExpr, LineMatchType};

use super::label_filter::{IpFilterError, IpMatcher};
use super::parsers::{PatternError, PatternMatcher};
use super::regex::simplify;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("invalid pattern expression: {0}")]
    Pattern(#[from] PatternError),
    #[error("invalid ip filter: {0}")]
    Ip(#[from] IpFilterError),
}

/// A compiled line filter.
///
/// The set of variants is closed on purpose: stages dispatch with an
/// exhaustive match, and the simplifier can rewrite regex filters into the
/// cheap literal variants.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches everything (`true`) or nothing (`false`).
    Trivial(bool),
    /// Matches non-empty lines.
    Exists,
    Contains {
        needle: String,
        case_insensitive: bool,
    },
    /// Whole-value equality, used when a regex simplifies in a label
    /// matching context.
    Equals {
        value: String,
        case_insensitive: bool,
    },
    Regex(Regex),
    Pattern(PatternMatcher),
    Ip {
        matcher: IpMatcher,
        negated: bool,
    },
    And(Vec<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Builds the filter for one match type and text, simplifying regexes
    /// into literal filters where possible.
    pub fn new(ty: LineMatchType, match_text: &str) -> Result<Filter, FilterError> {
        let filter = match ty {
            LineMatchType::Equal => {
                if match_text.is_empty() {
                    Filter::Trivial(true)
                } else {
                    Filter::Contains {
                        needle: match_text.to_string(),
                        case_insensitive: false,
                    }
                }
            }
            LineMatchType::NotEqual => {
                Filter::negate(Filter::new(LineMatchType::Equal, match_text)?)
            }
            LineMatchType::Regexp => match simplify(match_text, false) {
                Some(simplified) => simplified,
                None => Filter::Regex(Regex::new(match_text)?),
            },
            LineMatchType::NotRegexp => {
                Filter::negate(Filter::new(LineMatchType::Regexp, match_text)?)
            }
            LineMatchType::Pattern => {
                let pattern = PatternMatcher::for_line_filter(match_text)?;
                if pattern.is_trivial() {
                    Filter::Trivial(true)
                } else {
                    Filter::Pattern(pattern)
                }
            }
            LineMatchType::NotPattern => {
                Filter::negate(Filter::new(LineMatchType::Pattern, match_text)?)
            }
        };
        Ok(filter)
    }

    fn negate(filter: Filter) -> Filter {
        match filter {
            Filter::Trivial(b) => Filter::Trivial(!b),
            Filter::Not(inner) => *inner,
            other => Filter::Not(Box::new(other)),
        }
    }

    /// Chains `left or right`, used while accumulating `a or b or c`.
    pub fn chain_or(left: Filter, right: Filter) -> Filter {
        Filter::Or(Box::new(left), Box::new(right))
    }

    /// ANDs a list of filters, keeping regex filters at the end of the
    /// chain so the cheap literal filters run first.
    pub fn and_all(mut filters: Vec<Filter>) -> Filter {
        filters.retain(|f| !matches!(f, Filter::Trivial(true)));
        if filters.is_empty() {
            return Filter::Trivial(true);
        }
        if filters.len() == 1 {
            return filters.remove(0);
        }
        let (cheap, regexes): (Vec<_>, Vec<_>) = filters
            .into_iter()
            .partition(|f| !matches!(f, Filter::Regex(_)));
        let mut ordered = cheap;
        ordered.extend(regexes);
        Filter::And(ordered)
    }

    /// Whether the line survives this filter.
    pub fn filter(&self, line: &str) -> bool {
        match self {
            Filter::Trivial(b) => *b,
            Filter::Exists => !line.is_empty(),
            Filter::Contains {
                needle,
                case_insensitive: false,
            } => line.contains(needle.as_str()),
            Filter::Contains {
                needle,
                case_insensitive: true,
            } => contains_ignore_ascii_case(line, needle),
            Filter::Equals {
                value,
                case_insensitive: false,
            } => line == value,
            Filter::Equals {
                value,
                case_insensitive: true,
            } => line.eq_ignore_ascii_case(value),
            Filter::Regex(re) => re.is_match(line),
            Filter::Pattern(pattern) => pattern.matches(line),
            Filter::Ip { matcher, negated } => {
                let found = line_contains_ip(line, matcher);
                if *negated {
                    !found
                } else {
                    found
                }
            }
            Filter::And(filters) => filters.iter().all(|f| f.filter(line)),
            Filter::Or(left, right) => left.filter(line) || right.filter(line),
            Filter::Not(inner) => !inner.filter(line),
        }
    }

    pub fn is_trivial_true(&self) -> bool {
        matches!(self, Filter::Trivial(true))
    }
}

fn contains_ignore_ascii_case(line: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    let needle = needle.as_bytes();
    if line.len() < needle.len() {
        return false;
    }
    line.as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

/// Scans a line for address-shaped tokens and tests them for membership.
fn line_contains_ip(line: &str, matcher: &IpMatcher) -> bool {
    let mut start = None;
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let is_addr_char = b.is_ascii_hexdigit() || b == b'.' || b == b':';
        match (start, is_addr_char) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                if matcher.matches_str(&line[s..i]) {
                    return true;
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if matcher.matches_str(&line[s..]) {
            return true;
        }
    }
    false
}

/// Compiles a parsed line filter chain into one executable filter tree.
///
/// The left chain accumulates right to left, so the collected filters are
/// reversed to restore source order before ANDing.
pub fn compile_line_filter(expr: &LineFilterExpr) -> Result<Filter, FilterError> {
    let mut acc = Vec::new();
    let mut current = Some(expr);
    while let Some(e) = current {
        acc.push(compile_clause(e)?);
        current = e.left.as_deref();
    }
    acc.reverse();
    Ok(Filter::and_all(acc))
}

fn compile_clause(expr: &LineFilterExpr) -> Result<Filter, FilterError> {
    let mut filter = compile_single(&expr.filter)?;
    let mut or = expr.or.as_deref();
    while let Some(next) = or {
        filter = Filter::chain_or(filter, compile_single(&next.filter)?);
        or = next.or.as_deref();
    }
    Ok(filter)
}

fn compile_single(spec: &LineFilterSpec) -> Result<Filter, FilterError> {
    if spec.is_ip() {
        let matcher = IpMatcher::parse(&spec.match_text)?;
        let negated = match spec.ty {
            LineMatchType::Equal => false,
            LineMatchType::NotEqual => true,
            _ => {
                return Err(FilterError::Ip(IpFilterError::UnsupportedMatchType(
                    spec.ty.to_string(),
                )))
            }
        };
        return Ok(Filter::Ip { matcher, negated });
    }
    Filter::new(spec.ty, &spec.match_text)
}

// Wire encoding of a single line filter: filter kind as a varint, then the
// match text and the operator name, each length-prefixed. No padding.

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterEncodeError {
    #[error("truncated line filter buffer")]
    Truncated,
    #[error("unknown line filter kind: {0}")]
    UnknownKind(u64),
    #[error("line filter text is not valid utf-8")]
    InvalidText,
}

pub fn encode_line_filter(spec: &LineFilterSpec, buf: &mut Vec<u8>) {
    put_uvarint(buf, spec.ty as u64);
    put_uvarint(buf, spec.match_text.len() as u64);
    buf.extend_from_slice(spec.match_text.as_bytes());
    let op = spec.op.as_deref().unwrap_or("");
    put_uvarint(buf, op.len() as u64);
    buf.extend_from_slice(op.as_bytes());
}

/// Decodes one line filter, returning it and the number of bytes consumed.
pub fn decode_line_filter(buf: &[u8]) -> Result<(LineFilterSpec, usize), FilterEncodeError> {
    let mut pos = 0;
    let kind = read_uvarint(buf, &mut pos)?;
    let ty = match kind {
        0 => LineMatchType::Equal,
        1 => LineMatchType::NotEqual,
        2 => LineMatchType::Regexp,
        3 => LineMatchType::NotRegexp,
        4 => LineMatchType::Pattern,
        5 => LineMatchType::NotPattern,
        other => return Err(FilterEncodeError::UnknownKind(other)),
    };
    let match_text = read_string(buf, &mut pos)?;
    let op = read_string(buf, &mut pos)?;
    let spec = LineFilterSpec {
        ty,
        match_text,
        op: if op.is_empty() { None } else { Some(op) },
    };
    Ok((spec, pos))
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64, FilterEncodeError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(FilterEncodeError::Truncated)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(FilterEncodeError::Truncated);
        }
    }
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String, FilterEncodeError> {
    let len = read_uvarint(buf, pos)? as usize;
    let end = pos.checked_add(len).ok_or(FilterEncodeError::Truncated)?;
    let bytes = buf.get(*pos..end).ok_or(FilterEncodeError::Truncated)?;
    *pos = end;
    String::from_utf8(bytes.to_vec()).map_err(|_| FilterEncodeError::InvalidText)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::new_or_line_filter;

    fn filter_expr(ty: LineMatchType, text: &str) -> LineFilterExpr {
        LineFilterExpr::new(ty, text.to_string(), None)
    }

    #[test]
    fn test_contains_filter() {
        let f = Filter::new(LineMatchType::Equal, "error").unwrap();
        assert!(f.filter("level=error msg=boom"));
        assert!(!f.filter("level=info"));
    }

    #[test]
    fn test_not_equal_filter() {
        let f = Filter::new(LineMatchType::NotEqual, "error").unwrap();
        assert!(!f.filter("level=error"));
        assert!(f.filter("level=info"));
    }

    #[test]
    fn test_empty_match_is_trivial() {
        let f = Filter::new(LineMatchType::Equal, "").unwrap();
        assert!(f.is_trivial_true());
    }

    #[test]
    fn test_regex_fallback() {
        let f = Filter::new(LineMatchType::Regexp, "err(or)?[0-9]+").unwrap();
        assert!(matches!(f, Filter::Regex(_)));
        assert!(f.filter("error42"));
        assert!(!f.filter("error"));
    }

    #[test]
    fn test_or_chain_positive() {
        // {app="x"} |= "foo" or "bar" matches a line containing "bar".
        let left = filter_expr(LineMatchType::Equal, "foo");
        let right = filter_expr(LineMatchType::Equal, "bar");
        let chained = new_or_line_filter(left, right);
        let f = compile_line_filter(&chained).unwrap();
        assert!(f.filter("only bar here"));
        assert!(f.filter("only foo here"));
        assert!(!f.filter("neither"));
    }

    #[test]
    fn test_or_chain_negative_de_morgan() {
        // != "a" or "b" or "c" must behave as !a && !b && !c.
        let a = filter_expr(LineMatchType::NotEqual, "a");
        let b = filter_expr(LineMatchType::Equal, "b");
        let c = filter_expr(LineMatchType::Equal, "c");
        let chained = new_or_line_filter(a, new_or_line_filter(b, c));
        let f = compile_line_filter(&chained).unwrap();

        for line in ["a", "b", "c", "xbx", "aaa"] {
            let expected = !line.contains('a') && !line.contains('b') && !line.contains('c');
            assert_eq!(f.filter(line), expected, "line {line:?}");
        }
        assert!(f.filter("dd"));
    }

    #[test]
    fn test_and_all_defers_regexes() {
        let contains = Filter::new(LineMatchType::Equal, "x").unwrap();
        let regex = Filter::new(LineMatchType::Regexp, "[0-9]{3}").unwrap();
        let combined = Filter::and_all(vec![regex, contains]);
        match combined {
            Filter::And(parts) => {
                assert!(matches!(parts[0], Filter::Contains { .. }));
                assert!(matches!(parts[1], Filter::Regex(_)));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_ip_line_filter() {
        let spec = LineFilterSpec {
            ty: LineMatchType::Equal,
            match_text: "192.168.0.0/16".to_string(),
            op: Some("ip".to_string()),
        };
        let f = compile_single(&spec).unwrap();
        assert!(f.filter("connection from 192.168.4.5 refused"));
        assert!(!f.filter("connection from 10.0.0.1 refused"));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let specs = [
            LineFilterSpec {
                ty: LineMatchType::Equal,
                match_text: "error".to_string(),
                op: None,
            },
            LineFilterSpec {
                ty: LineMatchType::NotRegexp,
                match_text: "lvl=(warn|error)".to_string(),
                op: None,
            },
            LineFilterSpec {
                ty: LineMatchType::NotEqual,
                match_text: "10.0.0.0/8".to_string(),
                op: Some("ip".to_string()),
            },
        ];
        for spec in &specs {
            let mut buf = Vec::new();
            encode_line_filter(spec, &mut buf);
            let (decoded, consumed) = decode_line_filter(&buf).unwrap();
            assert_eq!(&decoded, spec);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let spec = LineFilterSpec {
            ty: LineMatchType::Equal,
            match_text: "some longer match text".to_string(),
            op: Some("ip".to_string()),
        };
        let mut buf = Vec::new();
        encode_line_filter(&spec, &mut buf);
        for len in 0..buf.len() {
            assert!(
                decode_line_filter(&buf[..len]).is_err(),
                "prefix of {len} bytes must not decode"
            );
        }
    }

    #[test]
    fn test_case_insensitive_contains() {
        assert!(contains_ignore_ascii_case("request FAILED hard", "failed"));
        assert!(!contains_ignore_ascii_case("request ok", "failed"));
        assert!(contains_ignore_ascii_case("x", ""));
    }
}
