//! Structured diagnostics.
//!
//! Every failure the builder can observe (a plugin returning a message, a
//! resolver bubbling up an `anyhow::Error`, a transformer handing back a
//! whole batch of annotated problems) is absorbed here, once, into the
//! canonical [`Diagnostic`] record. Code past this boundary never has to ask
//! whether an error came with a file name or a file path, a stack or a code
//! frame.
//!
//! Diagnostics always travel as a non-empty, ordered list wrapped in
//! [`ThrowableDiagnostic`], so a single failure can point at several places
//! in the source at once.

mod frame;
mod json;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

pub use crate::diagnostic::frame::RenderOptions;
pub use crate::diagnostic::json::{
    HighlightKind, JsonHighlight, JsonHighlightError, encode_json_key_component,
    generate_json_code_highlights,
};

/// Origin assigned to diagnostics built from bare strings and errors.
pub const DEFAULT_ORIGIN: &str = "Error";

/// Origin assigned when a diagnostic bundle is normalized and a member has no
/// origin of its own.
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// A 1-based position in source text. A tab is always a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// A highlighted span inside a [`CodeFrame`]; both ends are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeHighlight {
    /// First highlighted character.
    pub start: Location,
    /// Last highlighted character.
    pub end: Location,
    /// Message displayed next to this highlight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CodeHighlight {
    pub fn new(start: Location, end: Location) -> Self {
        Self {
            start,
            end,
            message: None,
        }
    }

    /// A highlight covering exactly one character.
    pub fn point(at: Location) -> Self {
        Self::new(at, at)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Source excerpt annotated with one or more highlights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFrame {
    /// The source text. When absent, reporters may read it from the
    /// diagnostic's `file_path`, keeping in mind that the file on disk can
    /// differ from what the plugin saw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub highlights: Vec<CodeHighlight>,
}

impl CodeFrame {
    pub fn new(code: impl Into<String>, highlights: Vec<CodeHighlight>) -> Self {
        Self {
            code: Some(code.into()),
            highlights,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warn,
    Info,
}

/// A style agnostic description of an error, warning or info message.
/// Reporters decide how to render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    /// Name of the plugin or stage that produced this diagnostic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_frame: Option<CodeFrame>,
    /// Suggestions for resolving the issue.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            origin: None,
            name: None,
            file_path: None,
            language: None,
            code_frame: None,
            hints: Vec::new(),
            stack: None,
            severity: Severity::Error,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::error(message).with_severity(Severity::Warn)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_file_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_code_frame(mut self, frame: CodeFrame) -> Self {
        self.code_frame = Some(frame);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// The loosely-shaped error a plugin may report.
///
/// This is the one place where the ad hoc field varieties live: a file can be
/// named through `file_name` or `file_path`, the pretty printed context can
/// be a `highlighted_code_frame`, a plain `code_frame`, or just a `stack`.
/// [`error_to_diagnostic`] settles all of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrintableError {
    pub message: String,
    pub name: Option<String>,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub code_frame: Option<String>,
    pub highlighted_code_frame: Option<String>,
    pub loc: Option<Location>,
    pub source: Option<String>,
    pub stack: Option<String>,
}

impl PrintableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Captures a standard error, folding its `source()` chain into the stack.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut cause = error.source();
        while let Some(inner) = cause {
            chain.push(format!("    {inner}"));
            cause = inner.source();
        }

        Self {
            message: error.to_string(),
            stack: (!chain.is_empty()).then(|| format!("Caused by:\n{}", chain.join("\n"))),
            ..Default::default()
        }
    }
}

impl From<anyhow::Error> for PrintableError {
    fn from(error: anyhow::Error) -> Self {
        let chain: Vec<_> = error
            .chain()
            .skip(1)
            .map(|cause| format!("    {cause}"))
            .collect();

        Self {
            message: error.to_string(),
            stack: (!chain.is_empty()).then(|| format!("Caused by:\n{}", chain.join("\n"))),
            ..Default::default()
        }
    }
}

/// A non-empty, ordered list of diagnostics that can travel as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Diagnostic>", into = "Vec<Diagnostic>")]
pub struct ThrowableDiagnostic {
    diagnostics: Vec<Diagnostic>,
}

/// Returned when a bundle would be built from an empty list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a diagnostic bundle needs at least one diagnostic")]
pub struct EmptyDiagnostics;

impl TryFrom<Vec<Diagnostic>> for ThrowableDiagnostic {
    type Error = EmptyDiagnostics;

    fn try_from(diagnostics: Vec<Diagnostic>) -> Result<Self, Self::Error> {
        if diagnostics.is_empty() {
            return Err(EmptyDiagnostics);
        }
        Ok(Self { diagnostics })
    }
}

impl From<ThrowableDiagnostic> for Vec<Diagnostic> {
    fn from(bundle: ThrowableDiagnostic) -> Self {
        bundle.diagnostics
    }
}

impl ThrowableDiagnostic {
    /// # Panics
    ///
    /// Panics when `diagnostics` is empty. An empty bundle cannot explain
    /// anything, so constructing one is a bug in the caller.
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        assert!(
            !diagnostics.is_empty(),
            "ThrowableDiagnostic requires at least one diagnostic"
        );
        Self { diagnostics }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn first(&self) -> &Diagnostic {
        &self.diagnostics[0]
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Diagnostic> {
        self.diagnostics.iter_mut()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn extend(&mut self, other: ThrowableDiagnostic) {
        self.diagnostics.extend(other.diagnostics);
    }

    /// Appends a hint to every diagnostic in the bundle.
    pub fn with_hint(mut self, hint: &str) -> Self {
        for diagnostic in &mut self.diagnostics {
            diagnostic.hints.push(hint.to_string());
        }
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Renders every diagnostic for a terminal, separated by blank lines.
    pub fn render(&self, options: &RenderOptions) -> String {
        self.diagnostics
            .iter()
            .map(|diagnostic| frame::render_diagnostic(diagnostic, options))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl std::fmt::Display for ThrowableDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let first = self.first();
        match &first.origin {
            Some(origin) => write!(f, "{origin}: {}", first.message)?,
            None => f.write_str(&first.message)?,
        }
        if self.len() > 1 {
            write!(f, " (and {} more)", self.len() - 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for ThrowableDiagnostic {}

impl From<Diagnostic> for ThrowableDiagnostic {
    fn from(diagnostic: Diagnostic) -> Self {
        Self::new(vec![diagnostic])
    }
}

impl<'a> IntoIterator for &'a ThrowableDiagnostic {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Anything that can be turned into diagnostics.
#[derive(Debug, Clone)]
pub enum Diagnostifiable {
    Message(String),
    Diagnostic(Diagnostic),
    List(Vec<Diagnostic>),
    Bundle(ThrowableDiagnostic),
    Error(PrintableError),
}

impl From<&str> for Diagnostifiable {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<String> for Diagnostifiable {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<Diagnostic> for Diagnostifiable {
    fn from(value: Diagnostic) -> Self {
        Self::Diagnostic(value)
    }
}

impl From<Vec<Diagnostic>> for Diagnostifiable {
    fn from(value: Vec<Diagnostic>) -> Self {
        Self::List(value)
    }
}

impl From<ThrowableDiagnostic> for Diagnostifiable {
    fn from(value: ThrowableDiagnostic) -> Self {
        Self::Bundle(value)
    }
}

impl From<PrintableError> for Diagnostifiable {
    fn from(value: PrintableError) -> Self {
        Self::Error(value)
    }
}

impl From<anyhow::Error> for Diagnostifiable {
    fn from(value: anyhow::Error) -> Self {
        Self::Error(value.into())
    }
}

impl From<std::io::Error> for Diagnostifiable {
    fn from(value: std::io::Error) -> Self {
        Self::Error(PrintableError::from_error(&value))
    }
}

/// Normalizes any [`Diagnostifiable`] into a non-empty list of diagnostics.
///
/// When `origin` is given it is stamped onto every resulting diagnostic,
/// replacing whatever origin they carried. Otherwise structured diagnostics
/// keep their own origin and fall back to [`UNKNOWN_ORIGIN`].
///
/// # Panics
///
/// Panics on an empty [`Diagnostifiable::List`].
pub fn normalize(input: impl Into<Diagnostifiable>, origin: Option<&str>) -> ThrowableDiagnostic {
    match input.into() {
        Diagnostifiable::Message(message) => ThrowableDiagnostic::from(
            Diagnostic::error(message).with_origin(origin.unwrap_or(DEFAULT_ORIGIN)),
        ),
        Diagnostifiable::Error(error) => error_to_diagnostic(error, origin).into(),
        Diagnostifiable::Diagnostic(diagnostic) => restamp(vec![diagnostic], origin),
        Diagnostifiable::List(list) => restamp(list, origin),
        Diagnostifiable::Bundle(bundle) => restamp(bundle.diagnostics, origin),
    }
}

fn restamp(mut list: Vec<Diagnostic>, origin: Option<&str>) -> ThrowableDiagnostic {
    for diagnostic in &mut list {
        match origin {
            Some(origin) => diagnostic.origin = Some(origin.to_string()),
            None if diagnostic.origin.is_none() => {
                diagnostic.origin = Some(UNKNOWN_ORIGIN.to_string())
            }
            None => {}
        }
    }

    ThrowableDiagnostic::new(list)
}

/// Maps a loosely-shaped error onto a single diagnostic.
pub fn error_to_diagnostic(error: PrintableError, origin: Option<&str>) -> Diagnostic {
    let code_frame = match (error.loc, error.source) {
        (Some(loc), Some(source)) => Some(CodeFrame::new(source, vec![CodeHighlight::point(loc)])),
        _ => None,
    };

    Diagnostic {
        message: error.message,
        origin: Some(origin.unwrap_or(DEFAULT_ORIGIN).to_string()),
        name: error.name,
        file_path: error.file_path.or(error.file_name).map(Utf8PathBuf::from),
        language: None,
        code_frame,
        hints: Vec::new(),
        stack: error
            .highlighted_code_frame
            .or(error.code_frame)
            .or(error.stack),
        severity: Severity::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[test]
    fn test_normalize_string() {
        let bundle = normalize("some message", None);
        assert_eq!(bundle.len(), 1);

        let diagnostic = bundle.first();
        assert_eq!(diagnostic.message, "some message");
        assert_eq!(diagnostic.origin.as_deref(), Some("Error"));
        assert!(diagnostic.code_frame.is_none());
    }

    #[test]
    fn test_normalize_string_with_origin() {
        let bundle = normalize("boom", Some("resolver"));
        assert_eq!(bundle.first().origin.as_deref(), Some("resolver"));
    }

    #[test]
    fn test_normalize_bundle_override_origin() {
        let original = ThrowableDiagnostic::new(vec![
            Diagnostic::error("first")
                .with_origin("transformer-js")
                .with_file_path("src/a.js")
                .with_hint("check the import"),
            Diagnostic::error("second").with_origin("transformer-css"),
        ]);

        let stamped = normalize(original.clone(), Some("packager"));
        assert_eq!(stamped.len(), 2);

        for (before, after) in original.iter().zip(stamped.iter()) {
            assert_eq!(after.origin.as_deref(), Some("packager"));
            let mut expected = before.clone();
            expected.origin = Some("packager".into());
            assert_eq!(&expected, after);
        }
    }

    #[test]
    fn test_normalize_bundle_keeps_origin() {
        let original = ThrowableDiagnostic::new(vec![
            Diagnostic::error("first").with_origin("transformer-js"),
            Diagnostic::error("second"),
        ]);

        let normalized = normalize(original, None);
        assert_eq!(
            normalized.first().origin.as_deref(),
            Some("transformer-js")
        );
        assert_eq!(normalized.diagnostics()[1].origin.as_deref(), Some("unknown"));
    }

    #[test]
    #[should_panic(expected = "at least one diagnostic")]
    fn test_empty_bundle_panics() {
        ThrowableDiagnostic::new(vec![]);
    }

    #[test]
    #[should_panic]
    fn test_normalize_empty_list_panics() {
        normalize(Vec::<Diagnostic>::new(), None);
    }

    #[test]
    fn test_error_prefers_highlighted_frame() {
        let error = PrintableError {
            message: "Unexpected token".into(),
            name: Some("SyntaxError".into()),
            file_name: Some("src/b.js".into()),
            code_frame: Some("plain frame".into()),
            highlighted_code_frame: Some("highlighted frame".into()),
            stack: Some("at parse (parser.js:1:1)".into()),
            ..Default::default()
        };

        let diagnostic = error_to_diagnostic(error, None);
        assert_eq!(diagnostic.stack.as_deref(), Some("highlighted frame"));
        assert_eq!(diagnostic.name.as_deref(), Some("SyntaxError"));
        assert_eq!(diagnostic.file_path.as_deref(), Some(Utf8Path::new("src/b.js")));
        assert_eq!(diagnostic.origin.as_deref(), Some("Error"));
    }

    #[test]
    fn test_error_stack_fallbacks() {
        let plain = PrintableError {
            code_frame: Some("plain frame".into()),
            stack: Some("raw stack".into()),
            ..PrintableError::new("x")
        };
        assert_eq!(
            error_to_diagnostic(plain, None).stack.as_deref(),
            Some("plain frame")
        );

        let raw = PrintableError {
            stack: Some("raw stack".into()),
            ..PrintableError::new("x")
        };
        assert_eq!(
            error_to_diagnostic(raw, None).stack.as_deref(),
            Some("raw stack")
        );
    }

    #[test]
    fn test_file_path_wins_over_file_name() {
        let error = PrintableError {
            file_name: Some("name.js".into()),
            file_path: Some("path.js".into()),
            ..PrintableError::new("x")
        };
        let diagnostic = error_to_diagnostic(error, None);
        assert_eq!(diagnostic.file_path.as_deref(), Some(Utf8Path::new("path.js")));
    }

    #[test]
    fn test_error_loc_synthesizes_point_frame() {
        let error = PrintableError {
            loc: Some(Location::new(2, 5)),
            source: Some("let a;\nlet b = ;\n".into()),
            ..PrintableError::new("Unexpected token ;")
        };

        let diagnostic = error_to_diagnostic(error, Some("transformer"));
        let frame = diagnostic.code_frame.expect("code frame");
        assert_eq!(frame.code.as_deref(), Some("let a;\nlet b = ;\n"));
        assert_eq!(frame.highlights.len(), 1);
        assert_eq!(frame.highlights[0].start, Location::new(2, 5));
        assert_eq!(frame.highlights[0].start, frame.highlights[0].end);
    }

    #[test]
    fn test_loc_without_source_has_no_frame() {
        let error = PrintableError {
            loc: Some(Location::new(1, 1)),
            ..PrintableError::new("x")
        };
        assert!(error_to_diagnostic(error, None).code_frame.is_none());
    }

    #[test]
    fn test_anyhow_chain_becomes_stack() {
        let error = anyhow::anyhow!("disk on fire").context("could not read src/c.js");
        let bundle = normalize(error, Some("resolver"));
        let diagnostic = bundle.first();
        assert_eq!(diagnostic.message, "could not read src/c.js");
        assert!(diagnostic.stack.as_deref().unwrap().contains("disk on fire"));
    }

    #[test]
    fn test_display_and_json() {
        let bundle = ThrowableDiagnostic::new(vec![
            Diagnostic::error("first").with_origin("resolver"),
            Diagnostic::error("second"),
        ]);
        assert_eq!(bundle.to_string(), "resolver: first (and 1 more)");

        let json = bundle.to_json().unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains(r#""origin":"resolver""#));

        let back: ThrowableDiagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn test_empty_bundle_is_rejected() {
        assert!(serde_json::from_str::<ThrowableDiagnostic>("[]").is_err());
        assert_eq!(ThrowableDiagnostic::try_from(Vec::new()), Err(EmptyDiagnostics));

        let one = ThrowableDiagnostic::try_from(vec![Diagnostic::error("only")]).unwrap();
        assert_eq!(one.to_string(), "only");
    }
}
