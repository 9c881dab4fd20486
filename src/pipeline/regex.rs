//! Compile-time regex simplification.
//!
//! Most filter expressions seen in practice are literals, alternations of
//! literals, or literals padded with `.*`. Those shapes rewrite into
//! contains/equality filters which are an order of magnitude cheaper than
//! general regex evaluation. Anything else falls back to a compiled regex.

use regex_syntax::hir::{Class, Hir, HirKind};

use super::line_filter::Filter;

/// Attempts to rewrite `pattern` into a literal filter tree.
///
/// With `match_whole` set the pattern is anchored to the full value (label
/// matching context) and a bare literal becomes an equality filter; without
/// it the search is unanchored (line filtering) and literals become
/// contains filters. Returns `None` when the pattern does not reduce, in
/// which case the caller compiles and evaluates the regex verbatim.
pub fn simplify(pattern: &str, match_whole: bool) -> Option<Filter> {
    let (pattern, case_insensitive) = match pattern.strip_prefix("(?i)") {
        Some(rest) => (rest, true),
        None => (pattern, false),
    };

    match pattern {
        "" | ".*" => return Some(Filter::Trivial(true)),
        ".+" => return Some(Filter::Exists),
        _ => {}
    }

    let hir = regex_syntax::ParserBuilder::new()
        .build()
        .parse(pattern)
        .ok()?;
    simplify_hir(&hir, case_insensitive, match_whole)
}

fn simplify_hir(hir: &Hir, ci: bool, match_whole: bool) -> Option<Filter> {
    match hir.kind() {
        HirKind::Empty => Some(Filter::Trivial(true)),
        HirKind::Literal(lit) => {
            let text = std::str::from_utf8(&lit.0).ok()?;
            Some(literal_filter(text.to_string(), ci, match_whole))
        }
        HirKind::Capture(capture) => simplify_hir(&capture.sub, ci, match_whole),
        HirKind::Alternation(legs) => simplify_alternation(legs, ci, match_whole),
        HirKind::Concat(parts) => simplify_concat(parts, ci, match_whole),
        _ => None,
    }
}

/// An alternation simplifies only if every leg simplifies; otherwise the
/// whole expression is evaluated as a regex.
fn simplify_alternation(legs: &[Hir], ci: bool, match_whole: bool) -> Option<Filter> {
    let mut filters = legs
        .iter()
        .map(|leg| simplify_hir(leg, ci, match_whole))
        .collect::<Option<Vec<_>>>()?;
    let mut chained = filters.remove(0);
    for filter in filters {
        chained = Filter::chain_or(chained, filter);
    }
    Some(chained)
}

fn simplify_concat(parts: &[Hir], ci: bool, match_whole: bool) -> Option<Filter> {
    // Leading and trailing `.*` wildcards reduce the match to a contains
    // search. In whole-value context a one-sided wildcard would change the
    // anchoring (prefix/suffix match), so only the fully padded shape and
    // the bare inner shapes are rewritten there.
    let mut start = 0;
    let mut end = parts.len();
    while start < end && is_any_char_star(&parts[start]) {
        start += 1;
    }
    while end > start && is_any_char_star(&parts[end - 1]) {
        end -= 1;
    }
    let stripped_leading = start > 0;
    let stripped_trailing = end < parts.len();
    if match_whole && stripped_leading != stripped_trailing {
        return None;
    }
    let contains_context = !match_whole || stripped_leading;

    let inner = &parts[start..end];
    match inner {
        [] => Some(Filter::Trivial(true)),
        [single] => simplify_hir(single, ci, !contains_context),
        [prefix, alternation] => {
            // A literal prefix followed by an alternation becomes one
            // contains filter per "prefix + alternative".
            let prefix = literal_text(prefix)?;
            let legs = match uncaptured(alternation).kind() {
                HirKind::Alternation(legs) => legs,
                _ => return None,
            };
            let mut filters = Vec::with_capacity(legs.len());
            for leg in legs {
                let text = literal_text(leg)?;
                filters.push(literal_filter(
                    format!("{prefix}{text}"),
                    ci,
                    !contains_context,
                ));
            }
            let mut chained = filters.remove(0);
            for filter in filters {
                chained = Filter::chain_or(chained, filter);
            }
            Some(chained)
        }
        _ => None,
    }
}

/// Sees through capture groups, which only affect match reporting.
fn uncaptured(hir: &Hir) -> &Hir {
    match hir.kind() {
        HirKind::Capture(capture) => uncaptured(&capture.sub),
        _ => hir,
    }
}

fn literal_text(hir: &Hir) -> Option<&str> {
    match uncaptured(hir).kind() {
        HirKind::Literal(lit) => std::str::from_utf8(&lit.0).ok(),
        _ => None,
    }
}

fn literal_filter(text: String, case_insensitive: bool, match_whole: bool) -> Filter {
    if match_whole {
        Filter::Equals {
            value: text,
            case_insensitive,
        }
    } else {
        Filter::Contains {
            needle: text,
            case_insensitive,
        }
    }
}

/// True for `.*` (with or without `(?s)`), the only repetition shape the
/// simplifier understands.
fn is_any_char_star(hir: &Hir) -> bool {
    let rep = match hir.kind() {
        HirKind::Repetition(rep) => rep,
        _ => return false,
    };
    if rep.min != 0 || rep.max.is_some() {
        return false;
    }
    matches_any_char(&rep.sub)
}

fn matches_any_char(hir: &Hir) -> bool {
    let class = match hir.kind() {
        HirKind::Class(class) => class,
        _ => return false,
    };
    match class {
        Class::Unicode(cls) => {
            let ranges = cls.ranges();
            match ranges.len() {
                // (?s:.) - one range covering every scalar value
                1 => ranges[0].start() == '\0' && ranges[0].end() == char::MAX,
                // `.` - everything except \n
                2 => {
                    ranges[0].start() == '\0'
                        && ranges[0].end() == '\t'
                        && ranges[1].start() == '\u{b}'
                        && ranges[1].end() == char::MAX
                }
                _ => false,
            }
        }
        Class::Bytes(cls) => {
            let ranges = cls.ranges();
            match ranges.len() {
                1 => ranges[0].start() == 0 && ranges[0].end() == 0xff,
                2 => {
                    ranges[0].start() == 0
                        && ranges[0].end() == b'\t'
                        && ranges[1].start() == 0x0b
                        && ranges[1].end() == 0xff
                }
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    /// Simplified filters must agree with the compiled regex on every
    /// input whenever simplification succeeds.
    fn assert_equivalent(pattern: &str, lines: &[&str]) {
        let filter = simplify(pattern, false)
            .unwrap_or_else(|| panic!("pattern {pattern:?} did not simplify"));
        let re = Regex::new(pattern).unwrap();
        for line in lines {
            assert_eq!(
                filter.filter(line),
                re.is_match(line),
                "pattern {pattern:?} disagrees on line {line:?}"
            );
        }
    }

    const SAMPLE_LINES: &[&str] = &[
        "",
        "foo",
        "bar",
        "foobar",
        "prefix foo suffix",
        "FOO",
        "fo",
        "errors everywhere",
        "error=timeout",
        "status=500",
    ];

    #[test]
    fn test_literal_becomes_contains() {
        let f = simplify("foo", false).unwrap();
        assert!(matches!(f, Filter::Contains { .. }));
        assert_equivalent("foo", SAMPLE_LINES);
    }

    #[test]
    fn test_literal_in_label_context_becomes_equals() {
        let f = simplify("foo", true).unwrap();
        assert!(matches!(f, Filter::Equals { .. }));
        assert!(f.filter("foo"));
        assert!(!f.filter("foobar"));
    }

    #[test]
    fn test_wildcard_padded_literal() {
        assert_equivalent(".*foo.*", SAMPLE_LINES);
        assert_equivalent("foo.*", SAMPLE_LINES);
        assert_equivalent(".*foo", SAMPLE_LINES);
    }

    #[test]
    fn test_alternation_of_literals() {
        assert_equivalent("foo|bar", SAMPLE_LINES);
        assert_equivalent("error|status", SAMPLE_LINES);
    }

    #[test]
    fn test_prefix_with_alternation() {
        assert_equivalent("error=(timeout|refused)", &[
            "error=timeout",
            "error=refused",
            "error=other",
            "timeout",
        ]);
    }

    #[test]
    fn test_case_insensitive_literal() {
        let f = simplify("(?i)foo", false).unwrap();
        assert!(f.filter("some FOO here"));
        assert!(!f.filter("some bar here"));
    }

    #[test]
    fn test_any_star_alone_is_trivial() {
        assert!(matches!(simplify(".*", false), Some(Filter::Trivial(true))));
        assert!(matches!(simplify(".*", true), Some(Filter::Trivial(true))));
        assert!(matches!(simplify(".+", false), Some(Filter::Exists)));
    }

    #[test]
    fn test_unreducible_shapes_fall_back() {
        assert!(simplify("[0-9]+", false).is_none());
        assert!(simplify("foo(bar)+", false).is_none());
        assert!(simplify("^anchored$", false).is_none());
        // One leg failing rejects the whole alternation.
        assert!(simplify("foo|[0-9]+", false).is_none());
    }

    #[test]
    fn test_one_sided_wildcard_rejected_for_labels() {
        // ^foo.*$ is a prefix match, not a contains match.
        assert!(simplify("foo.*", true).is_none());
        assert!(simplify(".*foo", true).is_none());
        // Fully padded is a contains match even when anchored.
        let f = simplify(".*foo.*", true).unwrap();
        assert!(f.filter("xx foo xx"));
    }

    #[test]
    fn test_alternation_in_label_context() {
        let f = simplify("foo|bar", true).unwrap();
        assert!(f.filter("foo"));
        assert!(f.filter("bar"));
        assert!(!f.filter("foobar"));
    }
}
