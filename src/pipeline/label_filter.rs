//! Label filterers.
//!
//! A label filter resolves the current value of one label, parses it
//! according to the filter kind (string, number, duration, byte size, ip),
//! and decides whether the line survives. Value parse failures record the
//! reserved error label and keep the line flowing so a surrounding error
//! policy decides its fate.

use std::net::IpAddr;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::query::ast::{ComparisonOp, LabelFilterExpr, LabelMatcher, MatchOp};
use crate::query::lexer::{parse_bytes, parse_duration};

use super::labels::LabelsBuilder;
use super::line_filter::Filter;
use super::regex::simplify;

/// Error kind recorded when a label value fails to parse for a filter.
pub const LABEL_FILTER_ERROR: &str = "LabelFilterErr";

#[derive(Debug, Error)]
pub enum LabelFilterError {
    #[error("invalid regex in label filter: {0}")]
    Regex(#[from] regex::Error),
    #[error(transparent)]
    Ip(#[from] IpFilterError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpFilterError {
    #[error("invalid ip address: {0}")]
    InvalidAddress(String),
    #[error("invalid cidr: {0}")]
    InvalidCidr(String),
    #[error("invalid ip range: {0}")]
    InvalidRange(String),
    #[error("ip filters only support equality matching, got {0}")]
    UnsupportedMatchType(String),
}

/// Membership test for a single address, a CIDR block, or an inclusive
/// address range.
#[derive(Debug, Clone)]
pub enum IpMatcher {
    Address(IpAddr),
    Cidr { network: IpAddr, prefix_len: u8 },
    Range { start: IpAddr, end: IpAddr },
}

impl IpMatcher {
    pub fn parse(pattern: &str) -> Result<Self, IpFilterError> {
        if let Some((lo, hi)) = pattern.split_once('-') {
            let start: IpAddr = lo
                .trim()
                .parse()
                .map_err(|_| IpFilterError::InvalidRange(pattern.to_string()))?;
            let end: IpAddr = hi
                .trim()
                .parse()
                .map_err(|_| IpFilterError::InvalidRange(pattern.to_string()))?;
            if start.is_ipv4() != end.is_ipv4() || ip_bits(start) > ip_bits(end) {
                return Err(IpFilterError::InvalidRange(pattern.to_string()));
            }
            return Ok(IpMatcher::Range { start, end });
        }
        if let Some((addr, prefix)) = pattern.split_once('/') {
            let network: IpAddr = addr
                .parse()
                .map_err(|_| IpFilterError::InvalidCidr(pattern.to_string()))?;
            let prefix_len: u8 = prefix
                .parse()
                .map_err(|_| IpFilterError::InvalidCidr(pattern.to_string()))?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            if prefix_len > max {
                return Err(IpFilterError::InvalidCidr(pattern.to_string()));
            }
            return Ok(IpMatcher::Cidr {
                network,
                prefix_len,
            });
        }
        let address: IpAddr = pattern
            .parse()
            .map_err(|_| IpFilterError::InvalidAddress(pattern.to_string()))?;
        Ok(IpMatcher::Address(address))
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpMatcher::Address(addr) => *addr == ip,
            IpMatcher::Cidr {
                network,
                prefix_len,
            } => {
                if network.is_ipv4() != ip.is_ipv4() {
                    return false;
                }
                if *prefix_len == 0 {
                    return true;
                }
                // v4 addresses sit in the top 32 bits, so the same shift
                // compares the leading prefix_len bits for both families.
                let shift = 128 - u32::from(*prefix_len);
                (ip_bits(ip) ^ ip_bits(*network)) >> shift == 0
            }
            IpMatcher::Range { start, end } => {
                start.is_ipv4() == ip.is_ipv4()
                    && ip_bits(*start) <= ip_bits(ip)
                    && ip_bits(ip) <= ip_bits(*end)
            }
        }
    }

    pub fn matches_str(&self, value: &str) -> bool {
        value.parse().map(|ip| self.matches(ip)).unwrap_or(false)
    }
}

fn ip_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)) << 96,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// A compiled label filterer.
#[derive(Debug, Clone)]
pub enum LabelFilter {
    And(Box<LabelFilter>, Box<LabelFilter>),
    Or(Box<LabelFilter>, Box<LabelFilter>),
    String {
        name: String,
        matcher: Filter,
    },
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
        matcher: IpMatcher,
        negated: bool,
    },
    Noop,
}

impl LabelFilter {
    pub fn compile(expr: &LabelFilterExpr) -> Result<Self, LabelFilterError> {
        let filter = match expr {
            LabelFilterExpr::And(left, right) => LabelFilter::And(
                Box::new(Self::compile(left)?),
                Box::new(Self::compile(right)?),
            ),
            LabelFilterExpr::Or(left, right) => LabelFilter::Or(
                Box::new(Self::compile(left)?),
                Box::new(Self::compile(right)?),
            ),
            LabelFilterExpr::Matcher(matcher) => LabelFilter::String {
                name: matcher.name.clone(),
                matcher: value_matcher(matcher)?,
            },
            LabelFilterExpr::Numeric { name, op, value } => LabelFilter::Numeric {
                name: name.clone(),
                op: *op,
                value: *value,
            },
            LabelFilterExpr::Duration { name, op, value } => LabelFilter::Duration {
                name: name.clone(),
                op: *op,
                value: *value,
            },
            LabelFilterExpr::Bytes { name, op, value } => LabelFilter::Bytes {
                name: name.clone(),
                op: *op,
                value: *value,
            },
            LabelFilterExpr::Ip {
                name,
                negated,
                pattern,
            } => LabelFilter::Ip {
                name: name.clone(),
                matcher: IpMatcher::parse(pattern)?,
                negated: *negated,
            },
        };
        Ok(filter)
    }

    /// Decides whether the line survives based on the label's resolved
    /// value. Parse failures mark the line as erroring instead of dropping
    /// it here.
    pub fn process(&self, lbs: &mut LabelsBuilder) -> bool {
        match self {
            LabelFilter::And(left, right) => left.process(lbs) && right.process(lbs),
            LabelFilter::Or(left, right) => {
                // Both sides run so either can record a parse error.
                let l = left.process(lbs);
                let r = right.process(lbs);
                l || r
            }
            LabelFilter::String { name, matcher } => {
                let value = lbs.get(name).unwrap_or("");
                matcher.filter(value)
            }
            LabelFilter::Numeric { name, op, value } => {
                let raw = lbs.get(name).unwrap_or("").to_string();
                match parse_numeric(&raw) {
                    Some(n) => compare(*op, n, *value),
                    None => {
                        lbs.set_error(LABEL_FILTER_ERROR, &format!("{raw}: invalid number"));
                        true
                    }
                }
            }
            LabelFilter::Duration { name, op, value } => {
                let raw = lbs.get(name).unwrap_or("").to_string();
                match parse_duration_value(&raw) {
                    Some(d) => compare(*op, d, *value),
                    None => {
                        lbs.set_error(LABEL_FILTER_ERROR, &format!("{raw}: invalid duration"));
                        true
                    }
                }
            }
            LabelFilter::Bytes { name, op, value } => {
                let raw = lbs.get(name).unwrap_or("").to_string();
                match parse_bytes(&raw) {
                    Some(b) => compare(*op, b, *value),
                    None => {
                        lbs.set_error(LABEL_FILTER_ERROR, &format!("{raw}: invalid byte size"));
                        true
                    }
                }
            }
            LabelFilter::Ip {
                name,
                matcher,
                negated,
            } => {
                let matched = lbs.get(name).map(|v| matcher.matches_str(v)).unwrap_or(false);
                matched != *negated
            }
            LabelFilter::Noop => true,
        }
    }

    /// Names this filter reads, used to seed parser hints.
    pub fn required_label_names(&self, out: &mut Vec<String>) {
        match self {
            LabelFilter::And(left, right) | LabelFilter::Or(left, right) => {
                left.required_label_names(out);
                right.required_label_names(out);
            }
            LabelFilter::String { name, .. }
            | LabelFilter::Numeric { name, .. }
            | LabelFilter::Duration { name, .. }
            | LabelFilter::Bytes { name, .. }
            | LabelFilter::Ip { name, .. } => {
                if !out.iter().any(|n| n == name) {
                    out.push(name.clone());
                }
            }
            LabelFilter::Noop => {}
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, LabelFilter::Noop)
    }
}

/// Builds the value matcher for a string label filter, reusing the regex
/// simplifier in whole-value mode.
pub(crate) fn value_matcher(matcher: &LabelMatcher) -> Result<Filter, LabelFilterError> {
    let filter = match matcher.op {
        MatchOp::Eq => Filter::Equals {
            value: matcher.value.clone(),
            case_insensitive: false,
        },
        MatchOp::Neq => Filter::Not(Box::new(Filter::Equals {
            value: matcher.value.clone(),
            case_insensitive: false,
        })),
        MatchOp::Re => match simplify(&matcher.value, true) {
            Some(simplified) => simplified,
            None => Filter::Regex(anchored(&matcher.value)?),
        },
        MatchOp::NotRe => {
            let inner = match simplify(&matcher.value, true) {
                Some(simplified) => simplified,
                None => Filter::Regex(anchored(&matcher.value)?),
            };
            Filter::Not(Box::new(inner))
        }
    };
    Ok(filter)
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

fn compare<T: PartialOrd>(op: ComparisonOp, left: T, right: T) -> bool {
    match op {
        ComparisonOp::Eq => left == right,
        ComparisonOp::Neq => left != right,
        ComparisonOp::Gt => left > right,
        ComparisonOp::Gte => left >= right,
        ComparisonOp::Lt => left < right,
        ComparisonOp::Lte => left <= right,
    }
}

/// Numbers also accept duration and byte-size spellings so `status > 200`
/// and `took > 1.5` keep working on labels like "3s" or "2MB".
fn parse_numeric(value: &str) -> Option<f64> {
    if let Ok(n) = value.parse::<f64>() {
        return Some(n);
    }
    if let Some(d) = parse_duration(value) {
        return Some(d.as_secs_f64());
    }
    parse_bytes(value).map(|b| b as f64)
}

fn parse_duration_value(value: &str) -> Option<Duration> {
    if let Some(d) = parse_duration(value) {
        return Some(d);
    }
    // Bare numbers read as seconds.
    value
        .parse::<f64>()
        .ok()
        .filter(|n| *n >= 0.0)
        .map(Duration::from_secs_f64)
}
