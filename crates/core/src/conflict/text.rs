//! Pure text checks shared by conflict classification and the resolution
//! heuristics.

use std::sync::OnceLock;

use regex_lite::Regex;

const STRUCTURAL_TOKENS: &[char] = &['{', '}', '[', ']', '(', ')', '<', '>'];

/// Number of bracket/brace/paren/angle characters in `text`.
pub fn structural_token_count(text: &str) -> usize {
    text.chars().filter(|c| STRUCTURAL_TOKENS.contains(c)).count()
}

/// Whether `()`, `[]` and `{}` nest correctly. Angle brackets are ignored
/// because they double as comparison operators.
pub fn brackets_balanced(text: &str) -> bool {
    let mut stack = Vec::new();
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

/// Whether any non-empty line ends with a `;` terminator.
pub fn has_statement_terminators(text: &str) -> bool {
    text.lines().any(|l| l.trim_end().ends_with(';'))
}

/// Whether indentation is detectably consistent: at least one indented
/// line, one indent character throughout, and (for spaces) every width a
/// multiple of the narrowest.
pub fn has_consistent_indentation(text: &str) -> bool {
    let indents: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| &l[..l.len() - l.trim_start().len()])
        .filter(|indent| !indent.is_empty())
        .collect();

    if indents.is_empty() {
        return false;
    }

    let all_tabs = indents.iter().all(|i| i.chars().all(|c| c == '\t'));
    let all_spaces = indents.iter().all(|i| i.chars().all(|c| c == ' '));
    if all_tabs {
        return true;
    }
    if !all_spaces {
        return false;
    }

    let unit = indents.iter().map(|i| i.len()).min().unwrap_or(1).max(1);
    indents.iter().all(|i| i.len() % unit == 0)
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^\s*(import\s|from\s+\S+\s+import\s|use\s+[\w:{]|require\s*\(|(const|let|var)\s+\w+\s*=\s*require\s*\(|#include\s|using\s+[\w.]+;|extern\s+crate\s)"#,
        )
        .expect("static import regex")
    })
}

fn function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(\b(fn|func|function|def)\s+[A-Za-z_]\w*\s*[(<]|\b\w+\s*=\s*(async\s*)?\([^)]*\)\s*=>)",
        )
        .expect("static function regex")
    })
}

fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\b(let|const|var|val)\s+(mut\s+)?[A-Za-z_]\w*|\b[A-Za-z_]\w*\s*:=)")
            .expect("static variable regex")
    })
}

/// Whether the first non-empty line is an import/require/use statement.
pub fn is_import_statement(text: &str) -> bool {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| import_re().is_match(l))
        .unwrap_or(false)
}

/// Whether `text` declares a function (`fn`, `def`, `function`, arrow fn).
pub fn has_function_declaration(text: &str) -> bool {
    function_re().is_match(text)
}

/// Whether `text` declares a variable (`let`, `const`, `var`, `:=`).
pub fn has_variable_declaration(text: &str) -> bool {
    variable_re().is_match(text)
}

/// Whether the two texts are equal once all whitespace is removed.
pub fn differs_only_in_whitespace(a: &str, b: &str) -> bool {
    let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    a != b && strip(a) == strip(b)
}
