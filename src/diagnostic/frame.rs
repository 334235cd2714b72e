use std::fmt::Write;

use console::Style;

use crate::diagnostic::{CodeFrame, CodeHighlight, Diagnostic, Severity};

const STYLE_GUTTER: Style = Style::new().dim();
const STYLE_MARKER: Style = Style::new().red().bold();
const STYLE_ERROR: Style = Style::new().red().bold();
const STYLE_WARN: Style = Style::new().yellow().bold();
const STYLE_INFO: Style = Style::new().blue().bold();
const STYLE_HINT: Style = Style::new().cyan();

/// How diagnostics should be printed.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Lines shown above and below the highlighted region.
    pub context_lines: usize,
    /// Whether to emit ANSI styles.
    pub colors: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            context_lines: 2,
            colors: console::colors_enabled_stderr(),
        }
    }
}

impl RenderOptions {
    pub fn plain() -> Self {
        Self {
            colors: false,
            ..Self::default()
        }
    }

    fn paint(&self, style: &Style, text: impl std::fmt::Display) -> String {
        if self.colors {
            style.apply_to(text).force_styling(true).to_string()
        } else {
            text.to_string()
        }
    }
}

impl CodeFrame {
    /// Renders the frame with a line number gutter and `^` markers under the
    /// highlighted characters. Returns `None` when there is no source text.
    ///
    /// Tabs in front of a highlight are copied into the marker line verbatim,
    /// so the markers stay aligned whatever the tab width.
    pub fn render(&self, options: &RenderOptions) -> Option<String> {
        let code = self.code.as_deref()?;
        let lines: Vec<&str> = code
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .collect();

        if self.highlights.is_empty() {
            return None;
        }

        let first = self.highlights.iter().map(|h| h.start.line).min()?.max(1);
        let last = self.highlights.iter().map(|h| h.end.line).max()?.max(first);

        let from = first.saturating_sub(options.context_lines).max(1);
        let to = (last + options.context_lines).min(lines.len());
        let width = to.to_string().len();

        let mut out = String::new();
        for number in from..=to {
            let text = lines[number - 1];
            let on_line: Vec<&CodeHighlight> = self
                .highlights
                .iter()
                .filter(|h| h.start.line <= number && number <= h.end.line)
                .collect();

            let prefix = if on_line.is_empty() { " " } else { ">" };
            let gutter = format!("{prefix} {number:>width$} |");
            let _ = writeln!(out, "{} {text}", options.paint(&STYLE_GUTTER, gutter));

            if on_line.is_empty() {
                continue;
            }

            let markers = marker_line(text, number, &on_line);
            let messages: Vec<&str> = on_line
                .iter()
                .filter(|h| h.end.line == number)
                .filter_map(|h| h.message.as_deref())
                .collect();

            let blank = format!("  {} |", " ".repeat(width));
            let _ = write!(
                out,
                "{} {}",
                options.paint(&STYLE_GUTTER, blank),
                options.paint(&STYLE_MARKER, markers)
            );
            if !messages.is_empty() {
                let _ = write!(out, " {}", options.paint(&STYLE_MARKER, messages.join(", ")));
            }
            out.push('\n');
        }

        Some(out)
    }
}

fn marker_line(text: &str, number: usize, highlights: &[&CodeHighlight]) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut marks: Vec<char> = Vec::new();

    for highlight in highlights {
        let start = if highlight.start.line == number {
            highlight.start.column.max(1)
        } else {
            1
        };
        let end = if highlight.end.line == number {
            highlight.end.column
        } else {
            chars.len()
        }
        .max(start);

        if marks.len() < end {
            marks.resize(end, ' ');
        }
        for column in start..=end {
            marks[column - 1] = '^';
        }
    }

    for (column, mark) in marks.iter_mut().enumerate() {
        if *mark == ' ' && chars.get(column) == Some(&'\t') {
            *mark = '\t';
        }
    }

    marks.into_iter().collect::<String>().trim_end().to_string()
}

pub(crate) fn render_diagnostic(diagnostic: &Diagnostic, options: &RenderOptions) -> String {
    let mut out = String::new();

    let style = match diagnostic.severity {
        Severity::Error => &STYLE_ERROR,
        Severity::Warn => &STYLE_WARN,
        Severity::Info => &STYLE_INFO,
    };

    let head = match &diagnostic.origin {
        Some(origin) => format!("{origin}: {}", diagnostic.message),
        None => diagnostic.message.clone(),
    };
    let _ = writeln!(out, "{}", options.paint(style, head));

    if let Some(path) = &diagnostic.file_path {
        match diagnostic
            .code_frame
            .as_ref()
            .and_then(|frame| frame.highlights.first())
        {
            Some(h) => {
                let _ = writeln!(out, "  at {path}:{}:{}", h.start.line, h.start.column);
            }
            None => {
                let _ = writeln!(out, "  at {path}");
            }
        }
    }

    if let Some(frame) = diagnostic.code_frame.as_ref().and_then(|f| f.render(options)) {
        out.push_str(&frame);
    } else if let Some(stack) = &diagnostic.stack {
        let _ = writeln!(out, "{stack}");
    }

    for hint in &diagnostic.hints {
        let _ = writeln!(out, "{}", options.paint(&STYLE_HINT, format!("  hint: {hint}")));
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Location;

    #[test]
    fn test_single_point() {
        let frame = CodeFrame::new(
            "let a = 1;\nlet b = ;\nlet c = 3;",
            vec![CodeHighlight::point(Location::new(2, 9)).with_message("expected expression")],
        );

        let out = frame.render(&RenderOptions::plain()).unwrap();
        let lines: Vec<_> = out.lines().collect();

        assert_eq!(lines[0], "  1 | let a = 1;");
        assert_eq!(lines[1], "> 2 | let b = ;");
        assert_eq!(lines[2], "    |         ^ expected expression");
        assert_eq!(lines[3], "  3 | let c = 3;");
    }

    #[test]
    fn test_tabs_are_copied() {
        let frame = CodeFrame::new(
            "\tfoo(bar)",
            vec![CodeHighlight::new(Location::new(1, 6), Location::new(1, 8))],
        );

        let out = frame.render(&RenderOptions::plain()).unwrap();
        let markers = out.lines().nth(1).unwrap();
        assert_eq!(markers, "    | \t    ^^^");
    }

    #[test]
    fn test_multiline_span() {
        let frame = CodeFrame::new(
            "a(\n  b,\n)",
            vec![CodeHighlight::new(Location::new(1, 2), Location::new(3, 1))],
        );

        let out = frame.render(&RenderOptions::plain()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[1], "    |  ^");
        assert_eq!(lines[3], "    | ^^^^");
        assert_eq!(lines[5], "    | ^");
    }

    #[test]
    fn test_no_code() {
        let frame = CodeFrame {
            code: None,
            highlights: vec![CodeHighlight::point(Location::new(1, 1))],
        };
        assert!(frame.render(&RenderOptions::plain()).is_none());
    }

    #[test]
    fn test_render_diagnostic() {
        let diagnostic = Diagnostic::error("Cannot resolve './missing'")
            .with_origin("resolver")
            .with_file_path("src/index.js")
            .with_hint("did you mean './missing.js'?");

        let out = render_diagnostic(&diagnostic, &RenderOptions::plain());
        assert_eq!(
            out,
            "resolver: Cannot resolve './missing'\n  at src/index.js\n  hint: did you mean './missing.js'?"
        );
    }
}
