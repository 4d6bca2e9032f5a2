//! Python import statement extraction and resolution.
//!
//! Handles the statement forms that introduce module dependencies:
//! - `import a.b, c as d`
//! - `from a.b import x, y`
//! - `from . import x` / `from ..pkg import (x, y)` (relative)
//!
//! Extraction is line-based over logical lines (parenthesized and
//! backslash-continued statements are joined). Triple-quoted strings and
//! comments are skipped.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One parsed import statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImportStmt {
    /// `import a.b, c`: each entry is a dotted module path.
    Plain(Vec<String>),
    /// `from <dots><module> import <names>`.
    From {
        level: usize,
        module: String,
        names: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// Matches `import a.b as c, d`.
static IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^import\s+(.+)$").expect("import regex"));

/// Matches `from ..a.b import x, y`.
static FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^from\s+(\.*)\s*([\w.]*)\s+import\s+(.+)$").expect("from-import regex")
});

/// A valid dotted identifier path.
static DOTTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+(\.\w+)*$").expect("dotted name regex"));

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract every import statement from Python source text.
pub(crate) fn parse_imports(source: &str) -> Vec<ImportStmt> {
    logical_lines(source)
        .iter()
        .filter_map(|line| parse_statement(line))
        .collect()
}

fn parse_statement(line: &str) -> Option<ImportStmt> {
    if let Some(caps) = FROM_RE.captures(line) {
        let level = caps[1].len();
        let module = caps[2].to_string();
        if level == 0 && module.is_empty() {
            return None;
        }
        let names = split_names(&caps[3]);
        return Some(ImportStmt::From {
            level,
            module,
            names,
        });
    }
    if let Some(caps) = IMPORT_RE.captures(line) {
        let modules = split_names(&caps[1]);
        if modules.is_empty() {
            return None;
        }
        return Some(ImportStmt::Plain(modules));
    }
    None
}

/// Split `a as b, (c, d)` into `["a", "c", "d"]`, dropping `*` and junk.
fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .filter_map(|part| {
            let part = part.trim().trim_matches(|c| c == '(' || c == ')').trim();
            let name = part.split_whitespace().next()?;
            DOTTED_RE.is_match(name).then(|| name.to_string())
        })
        .collect()
}

/// Join continued physical lines and drop strings and comments.
fn logical_lines(source: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut in_docstring: Option<&str> = None;

    for raw in source.lines() {
        let mut line = raw.trim();

        if let Some(quote) = in_docstring {
            match line.find(quote) {
                Some(end) => {
                    in_docstring = None;
                    line = line[end + 3..].trim();
                }
                None => continue,
            }
        }

        for quote in ["\"\"\"", "'''"] {
            if let Some(start) = line.find(quote) {
                let rest = &line[start + 3..];
                if !rest.contains(quote) {
                    in_docstring = Some(quote);
                    line = line[..start].trim();
                }
                break;
            }
        }

        let code = match line.find('#') {
            Some(pos) => line[..pos].trim_end(),
            None => line,
        };
        if code.is_empty() && depth == 0 {
            continue;
        }

        let (code, continued) = match code.strip_suffix('\\') {
            Some(stripped) => (stripped, true),
            None => (code, false),
        };

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(code);
        depth += code.matches('(').count() as i32 - code.matches(')').count() as i32;

        if depth <= 0 && !continued {
            lines.push(std::mem::take(&mut current));
            depth = 0;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a unit's import statements to dependency ids.
///
/// Imports that name a known unit (or something inside one) resolve to the
/// longest known unit id. Absolute imports that match nothing are kept as
/// external ids; unresolvable relative imports are dropped. The importing
/// unit never depends on itself.
pub(crate) fn resolve_imports(
    stmts: &[ImportStmt],
    importer: &str,
    is_package: bool,
    known: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut deps = BTreeSet::new();

    for stmt in stmts {
        match stmt {
            ImportStmt::Plain(modules) => {
                for module in modules {
                    deps.insert(
                        longest_known_prefix(module, known).unwrap_or_else(|| module.clone()),
                    );
                }
            }
            ImportStmt::From {
                level: 0,
                module,
                names,
            } => {
                let mut found = false;
                for name in names {
                    if let Some(id) = longest_known_prefix(&format!("{module}.{name}"), known) {
                        deps.insert(id);
                        found = true;
                    }
                }
                if !found {
                    deps.insert(module.clone());
                }
            }
            ImportStmt::From {
                level,
                module,
                names,
            } => {
                let Some(base) = relative_base(importer, is_package, *level, module) else {
                    continue;
                };
                for name in names {
                    let full = if base.is_empty() {
                        name.clone()
                    } else {
                        format!("{base}.{name}")
                    };
                    if let Some(id) = longest_known_prefix(&full, known) {
                        deps.insert(id);
                    }
                }
                if let Some(id) = (!base.is_empty())
                    .then(|| longest_known_prefix(&base, known))
                    .flatten()
                {
                    if names.is_empty() || !module.is_empty() {
                        deps.insert(id);
                    }
                }
            }
        }
    }

    deps.remove(importer);
    deps
}

/// Absolute dotted path that a relative `from` import refers to.
fn relative_base(importer: &str, is_package: bool, level: usize, module: &str) -> Option<String> {
    let mut parts: Vec<&str> = importer.split('.').collect();
    if !is_package {
        parts.pop();
    }
    for _ in 1..level {
        parts.pop()?;
    }
    if !module.is_empty() {
        parts.push(module);
    }
    Some(parts.join("."))
}

fn longest_known_prefix(dotted: &str, known: &BTreeSet<String>) -> Option<String> {
    let parts: Vec<&str> = dotted.split('.').collect();
    (1..=parts.len())
        .rev()
        .map(|n| parts[..n].join("."))
        .find(|candidate| known.contains(candidate))
}
