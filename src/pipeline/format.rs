//! Line and label formatting stages.

use std::borrow::Cow;

use thiserror::Error;

use super::labels::{LabelCategory, LabelsBuilder, ERROR_DETAILS_LABEL, ERROR_LABEL};

/// Placeholder resolving to the current line content.
pub const LINE_FIELD: &str = "__line__";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("line template placeholder is missing a closing delimiter")]
    UnclosedPlaceholder,
    #[error("line template placeholder cannot be empty")]
    EmptyPlaceholder,
    #[error("line template placeholder must reference a field, like {0}")]
    NotAFieldReference(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelFormatError {
    #[error("cannot rename or assign the reserved label {0}")]
    ReservedLabel(String),
    #[error("duplicate label format target: {0}")]
    DuplicateTarget(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateSegment {
    Literal(String),
    Field(String),
}

/// A `{{.field}}` text template, compiled once at stage construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTemplate {
    segments: Vec<TemplateSegment>,
}

impl LineTemplate {
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(TemplateSegment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or(TemplateError::UnclosedPlaceholder)?;
            let token = after[..close].trim();
            if token.is_empty() {
                return Err(TemplateError::EmptyPlaceholder);
            }
            let field = token
                .strip_prefix('.')
                .filter(|f| !f.is_empty())
                .ok_or_else(|| TemplateError::NotAFieldReference(token.to_string()))?;
            segments.push(TemplateSegment::Field(field.to_string()));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(TemplateSegment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    /// Renders the template against the current line and label state.
    /// Unknown fields render empty.
    pub fn render(&self, line: &str, lbs: &LabelsBuilder) -> String {
        let mut out = String::with_capacity(line.len());
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => out.push_str(text),
                TemplateSegment::Field(name) if name == LINE_FIELD => out.push_str(line),
                TemplateSegment::Field(name) => {
                    if let Some(value) = lbs.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

/// One `label_format` rule: either renaming an existing label or rendering
/// a template into a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFmt {
    Rename { target: String, source: String },
    Template { target: String, template: LineTemplate },
}

impl LabelFmt {
    fn target(&self) -> &str {
        match self {
            LabelFmt::Rename { target, .. } | LabelFmt::Template { target, .. } => target,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LabelsFormatter {
    formats: Vec<LabelFmt>,
}

impl LabelsFormatter {
    pub fn new(formats: Vec<LabelFmt>) -> Result<Self, LabelFormatError> {
        for (i, format) in formats.iter().enumerate() {
            let target = format.target();
            if target == ERROR_LABEL || target == ERROR_DETAILS_LABEL {
                return Err(LabelFormatError::ReservedLabel(target.to_string()));
            }
            if formats[..i].iter().any(|f| f.target() == target) {
                return Err(LabelFormatError::DuplicateTarget(target.to_string()));
            }
        }
        Ok(Self { formats })
    }

    pub fn process(&self, line: &str, lbs: &mut LabelsBuilder) -> bool {
        for format in &self.formats {
            match format {
                LabelFmt::Rename { target, source } => {
                    if let Some(value) = lbs.get(source).map(str::to_string) {
                        lbs.set(LabelCategory::Parsed, target, &value);
                        lbs.del(source);
                    }
                }
                LabelFmt::Template { target, template } => {
                    let value = template.render(line, lbs);
                    lbs.set(LabelCategory::Parsed, target, &value);
                }
            }
        }
        true
    }
}

/// Strips ANSI color sequences from a line, allocating only when one is
/// present.
pub fn decolorize(line: &str) -> Cow<'_, str> {
    if !line.contains('\x1b') {
        return Cow::Borrowed(line);
    }
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for terminator in chars.by_ref() {
                if terminator == 'm' {
                    break;
                }
            }
            continue;
        }
        out.push(ch);
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::labels::{BaseLabels, Labels};
    use std::sync::Arc;

    fn builder(pairs: &[(&str, &str)]) -> LabelsBuilder {
        let base = Arc::new(BaseLabels::new(Labels::from_pairs(pairs)));
        LabelsBuilder::new(base, Default::default())
    }

    #[test]
    fn test_template_renders_fields_and_literals() {
        let template = LineTemplate::compile("{{.status}} - {{.msg}}").unwrap();
        let mut lbs = builder(&[]);
        lbs.set(LabelCategory::Parsed, "status", "200");
        lbs.set(LabelCategory::Parsed, "msg", "ok");
        assert_eq!(template.render("ignored", &lbs), "200 - ok");
    }

    #[test]
    fn test_template_unknown_field_renders_empty() {
        let template = LineTemplate::compile("[{{.missing}}]").unwrap();
        let lbs = builder(&[]);
        assert_eq!(template.render("line", &lbs), "[]");
    }

    #[test]
    fn test_template_line_field() {
        let template = LineTemplate::compile("line={{.__line__}}").unwrap();
        let lbs = builder(&[]);
        assert_eq!(template.render("raw", &lbs), "line=raw");
    }

    #[test]
    fn test_template_compile_errors() {
        assert_eq!(
            LineTemplate::compile("{{.open"),
            Err(TemplateError::UnclosedPlaceholder)
        );
        assert_eq!(
            LineTemplate::compile("{{  }}"),
            Err(TemplateError::EmptyPlaceholder)
        );
        assert!(matches!(
            LineTemplate::compile("{{upper}}"),
            Err(TemplateError::NotAFieldReference(_))
        ));
    }

    #[test]
    fn test_label_format_rename_moves_value() {
        let formatter = LabelsFormatter::new(vec![LabelFmt::Rename {
            target: "severity".to_string(),
            source: "level".to_string(),
        }])
        .unwrap();
        let mut lbs = builder(&[]);
        lbs.set(LabelCategory::Parsed, "level", "warn");
        formatter.process("", &mut lbs);
        assert_eq!(lbs.get("severity"), Some("warn"));
        assert_eq!(lbs.get("level"), None);
    }

    #[test]
    fn test_label_format_template() {
        let formatter = LabelsFormatter::new(vec![LabelFmt::Template {
            target: "status_class".to_string(),
            template: LineTemplate::compile("{{.status}}xx").unwrap(),
        }])
        .unwrap();
        let mut lbs = builder(&[]);
        lbs.set(LabelCategory::Parsed, "status", "5");
        formatter.process("", &mut lbs);
        assert_eq!(lbs.get("status_class"), Some("5xx"));
    }

    #[test]
    fn test_label_format_validation() {
        assert!(matches!(
            LabelsFormatter::new(vec![LabelFmt::Rename {
                target: ERROR_LABEL.to_string(),
                source: "x".to_string(),
            }]),
            Err(LabelFormatError::ReservedLabel(_))
        ));
        assert!(matches!(
            LabelsFormatter::new(vec![
                LabelFmt::Rename {
                    target: "a".to_string(),
                    source: "x".to_string(),
                },
                LabelFmt::Rename {
                    target: "a".to_string(),
                    source: "y".to_string(),
                },
            ]),
            Err(LabelFormatError::DuplicateTarget(_))
        ));
    }

    #[test]
    fn test_decolorize() {
        assert_eq!(decolorize("plain"), Cow::Borrowed("plain"));
        assert_eq!(
            decolorize("\x1b[31merror\x1b[0m done"),
            Cow::<str>::Owned("error done".to_string())
        );
    }
}
