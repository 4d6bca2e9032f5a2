//! Outline renderer: one Markdown note per Python module.
//!
//! The note carries YAML frontmatter, the module docstring, the public
//! top-level classes and functions, and a wikilink to every dependency.
//! Output depends only on the source text and unit metadata, so an
//! unchanged module always renders to identical bytes.

use std::sync::LazyLock;

use docvault_core::DocRenderer;
use docvault_shared::{Artifact, SourceUnit, UnitError};
use regex::Regex;
use tracing::debug;

/// File name of the note written for every unit.
pub const NOTE_FILE: &str = "index.md";

const TRIPLE_QUOTES: [&str; 2] = ["\"\"\"", "'''"];

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// `class Name(Base, Other):`
static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^class\s+([A-Za-z_]\w*)\s*(?:\(([^)]*)\))?\s*:").expect("class regex")
});

/// `def name(` or `async def name(`
static DEF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(async\s+)?def\s+([A-Za-z_]\w*)\s*\(").expect("def regex")
});

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

/// A public top-level name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Base classes for a class, `async` for a coroutine.
    pub detail: Option<String>,
}

/// What the note documents about a module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outline {
    pub docstring: Option<String>,
    pub classes: Vec<Symbol>,
    pub functions: Vec<Symbol>,
}

impl Outline {
    /// Extract the outline from module source.
    pub fn parse(source: &str) -> Result<Self, UnitError> {
        if source.contains('\0') {
            return Err(UnitError::Analysis("source contains NUL bytes".into()));
        }

        let mut outline = Self::default();
        let mut seen_statement = false;
        let mut lines = source.lines().enumerate();

        while let Some((index, line)) = lines.next() {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let top_level = trimmed.len() == line.len();
            let first_statement = !seen_statement;
            seen_statement = true;

            if top_level {
                outline.collect_symbol(line);
            }

            let mut text = trimmed.to_string();
            if let Some(quote) = open_quote(trimmed) {
                loop {
                    let Some((_, next)) = lines.next() else {
                        return Err(UnitError::Analysis(format!(
                            "unterminated triple-quoted string starting on line {}",
                            index + 1
                        )));
                    };
                    text.push('\n');
                    text.push_str(next);
                    if next.contains(quote) {
                        break;
                    }
                }
            }

            if first_statement && top_level {
                outline.docstring = docstring_of(&text);
            }
        }
        Ok(outline)
    }

    fn collect_symbol(&mut self, line: &str) {
        if let Some(caps) = CLASS_RE.captures(line) {
            let name = &caps[1];
            if is_public(name) {
                let bases = caps
                    .get(2)
                    .map(|m| m.as_str().trim())
                    .filter(|b| !b.is_empty());
                self.classes.push(Symbol {
                    name: name.to_string(),
                    detail: bases.map(str::to_string),
                });
            }
        } else if let Some(caps) = DEF_RE.captures(line) {
            let name = &caps[2];
            if is_public(name) {
                self.functions.push(Symbol {
                    name: name.to_string(),
                    detail: caps.get(1).map(|_| "async".to_string()),
                });
            }
        }
    }
}

fn is_public(name: &str) -> bool {
    !name.starts_with('_')
}

/// The triple quote left open at the end of `line`, if any.
fn open_quote(line: &str) -> Option<&'static str> {
    let quote = TRIPLE_QUOTES
        .iter()
        .filter_map(|q| line.find(q).map(|pos| (pos, *q)))
        .min()
        .map(|(_, q)| q)?;
    (line.matches(quote).count() % 2 == 1).then_some(quote)
}

/// Text of a statement that is a bare triple-quoted string literal.
fn docstring_of(statement: &str) -> Option<String> {
    let body = statement
        .strip_prefix(['r', 'R', 'u', 'U'])
        .unwrap_or(statement);
    let quote = TRIPLE_QUOTES.iter().find(|q| body.starts_with(**q))?;
    let inner = &body[quote.len()..];
    let end = inner.find(quote)?;
    let text = inner[..end]
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// [`DocRenderer`] that reads the module from disk and emits one note.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutlineRenderer;

impl DocRenderer for OutlineRenderer {
    fn analyze_and_render(&self, unit: &SourceUnit) -> Result<Vec<Artifact>, UnitError> {
        let bytes = std::fs::read(&unit.path).map_err(|e| {
            UnitError::Analysis(format!("cannot read {}: {e}", unit.path.display()))
        })?;
        let source = String::from_utf8(bytes).map_err(|e| {
            UnitError::Analysis(format!("{} is not valid UTF-8: {e}", unit.path.display()))
        })?;
        let outline = Outline::parse(&source)?;
        debug!(
            unit = %unit.id,
            classes = outline.classes.len(),
            functions = outline.functions.len(),
            "module outlined"
        );
        Ok(vec![Artifact {
            relative_path: NOTE_FILE.into(),
            contents: render_note(unit, &outline).into_bytes(),
        }])
    }
}

fn render_note(unit: &SourceUnit, outline: &Outline) -> String {
    let mut md = build_frontmatter(unit);
    md.push_str(&format!("\n# {}\n", unit.id));

    if let Some(doc) = &outline.docstring {
        md.push_str(&format!("\n{doc}\n"));
    }

    if !outline.classes.is_empty() {
        md.push_str("\n## Classes\n\n");
        for class in &outline.classes {
            match &class.detail {
                Some(bases) => md.push_str(&format!("- `{}({bases})`\n", class.name)),
                None => md.push_str(&format!("- `{}`\n", class.name)),
            }
        }
    }

    if !outline.functions.is_empty() {
        md.push_str("\n## Functions\n\n");
        for function in &outline.functions {
            match &function.detail {
                Some(prefix) => md.push_str(&format!("- `{prefix} {}()`\n", function.name)),
                None => md.push_str(&format!("- `{}()`\n", function.name)),
            }
        }
    }

    let mut deps: Vec<&str> = unit.dependencies.iter().map(|d| d.as_str()).collect();
    deps.sort_unstable();
    deps.dedup();
    if !deps.is_empty() {
        md.push_str("\n## Dependencies\n\n");
        for dep in deps {
            md.push_str(&format!("- [[{dep}]]\n"));
        }
    }
    md
}

fn build_frontmatter(unit: &SourceUnit) -> String {
    let file_name = unit
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let kind = if file_name == "__init__.py" {
        "package"
    } else {
        "module"
    };
    let mut tags = vec![kind.to_string()];
    if let Some((top, _)) = unit.id.as_str().split_once('.') {
        tags.push(top.to_string());
    }

    let mut fm = String::from("---\n");
    fm.push_str(&format!("title: \"{}\"\n", escape_yaml_string(unit.id.as_str())));
    fm.push_str(&format!("tags: [{}]\n", tags.join(", ")));
    fm.push_str(&format!("source: \"{}\"\n", escape_yaml_string(&file_name)));
    fm.push_str("type: documentation\n");
    fm.push_str("---\n");
    fm
}

fn escape_yaml_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use docvault_shared::{Fingerprint, UnitId};
    use uuid::Uuid;

    use super::*;

    const SAMPLE: &str = r#"#!/usr/bin/env python
"""Utilities for parsing.

   Second paragraph.
"""

import os
from .core import Engine

TEMPLATE = """
def not_a_function():
    pass
"""

class Parser(Base, metaclass=Meta):
    def method(self):
        pass

class _Hidden:
    pass

def parse(text):
    return text

async def fetch(url):
    pass

def _helper():
    pass
"#;

    fn temp_unit(id: &str, file: &str, bytes: &[u8], deps: &[&str]) -> (SourceUnit, PathBuf) {
        let dir = std::env::temp_dir().join(format!("dv-outline-test-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, bytes).unwrap();
        let unit = SourceUnit {
            id: UnitId::from(id),
            path,
            fingerprint: Fingerprint::of_bytes(bytes),
            dependencies: deps.iter().map(|d| UnitId::from(*d)).collect(),
            size_bytes: bytes.len() as u64,
        };
        (unit, dir)
    }

    #[test]
    fn parses_docstring_and_public_symbols() {
        let outline = Outline::parse(SAMPLE).unwrap();
        assert_eq!(
            outline.docstring.as_deref(),
            Some("Utilities for parsing.\n\nSecond paragraph.")
        );
        assert_eq!(
            outline.classes,
            vec![Symbol {
                name: "Parser".into(),
                detail: Some("Base, metaclass=Meta".into()),
            }]
        );
        let names: Vec<&str> = outline.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["parse", "fetch"]);
        assert_eq!(outline.functions[1].detail.as_deref(), Some("async"));
    }

    #[test]
    fn docstring_must_be_first_statement() {
        let outline = Outline::parse("x = 1\n\"\"\"Not a docstring.\"\"\"\n").unwrap();
        assert_eq!(outline.docstring, None);
        let outline = Outline::parse("r'''Raw doc.'''\n").unwrap();
        assert_eq!(outline.docstring.as_deref(), Some("Raw doc."));
    }

    #[test]
    fn unterminated_string_is_an_analysis_error() {
        let err = Outline::parse("\"\"\"never closed\n\ndef f():\n    pass\n").unwrap_err();
        assert!(matches!(err, UnitError::Analysis(ref m) if m.contains("line 1")));
    }

    #[test]
    fn renders_note_with_frontmatter_and_links() {
        let (unit, dir) = temp_unit(
            "pkg.parser",
            "parser.py",
            SAMPLE.as_bytes(),
            &["pkg.core", "os", "pkg.core"],
        );
        let artifacts = OutlineRenderer.analyze_and_render(&unit).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].relative_path, PathBuf::from(NOTE_FILE));

        let note = String::from_utf8(artifacts[0].contents.clone()).unwrap();
        assert!(note.starts_with("---\ntitle: \"pkg.parser\"\ntags: [module, pkg]\n"));
        assert!(note.contains("source: \"parser.py\""));
        assert!(note.contains("# pkg.parser\n\nUtilities for parsing."));
        assert!(note.contains("- `Parser(Base, metaclass=Meta)`"));
        assert!(note.contains("- `async fetch()`"));
        assert!(note.contains("## Dependencies\n\n- [[os]]\n- [[pkg.core]]\n"));
        assert!(!note.contains("not_a_function"));

        // Rendering is a pure function of the source.
        let again = OutlineRenderer.analyze_and_render(&unit).unwrap();
        assert_eq!(again, artifacts);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn package_init_is_tagged_as_package() {
        let (unit, dir) = temp_unit("pkg", "__init__.py", b"", &[]);
        let artifacts = OutlineRenderer.analyze_and_render(&unit).unwrap();
        let note = String::from_utf8(artifacts[0].contents.clone()).unwrap();
        assert!(note.contains("tags: [package]\n"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unreadable_or_binary_source_is_an_analysis_error() {
        let (unit, dir) = temp_unit("pkg.bin", "bin.py", &[0xff, 0xfe, 0x00], &[]);
        let err = OutlineRenderer.analyze_and_render(&unit).unwrap_err();
        assert!(matches!(err, UnitError::Analysis(ref m) if m.contains("UTF-8")));

        let mut missing = unit.clone();
        missing.path = dir.join("missing.py");
        let err = OutlineRenderer.analyze_and_render(&missing).unwrap_err();
        assert!(matches!(err, UnitError::Analysis(ref m) if m.contains("cannot read")));
        let _ = std::fs::remove_dir_all(dir);
    }
}
