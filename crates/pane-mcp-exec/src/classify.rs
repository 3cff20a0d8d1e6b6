//! Complexity classifier: picks how command text is delivered.
//!
//! Rules, first match wins:
//!
//! 1. control characters or escape sequences → `TextInjection`
//! 2. unbalanced quotes, or both quote kinds mixed with non-ASCII text → `BracketedPaste`
//! 3. heredoc (`<<`, `<<-`; not `<<<`) → `ScriptFile`
//! 4. any other multi-line text → `BracketedPaste`
//! 5. plain words with simple pipes and redirections → `Direct`
//! 6. anything else → the configured ambiguous default

use lazy_static::lazy_static;
use pane_mcp_core::ExecutionStrategy;
use regex::Regex;

lazy_static! {
    static ref HEREDOC: Regex =
        Regex::new(r#"(?:^|[^<])<<-?[ \t]*['"]?[A-Za-z_][A-Za-z0-9_]*"#).expect("heredoc regex is valid");
    static ref PLAIN: Regex = Regex::new(
        r"^[A-Za-z0-9 _./:=,+@%~-]+(?:(?:\||[0-9]?>>?|<|>&[0-9])[A-Za-z0-9 _./:=,+@%~-]*)*$"
    )
    .expect("plain command regex is valid");
}

/// Classify with `BracketedPaste` as the ambiguous default.
pub fn classify(text: &str) -> ExecutionStrategy {
    classify_with(text, ExecutionStrategy::BracketedPaste)
}

/// Classify, falling back to `ambiguous` when no stricter rule applies.
pub fn classify_with(text: &str, ambiguous: ExecutionStrategy) -> ExecutionStrategy {
    if has_control_chars(text) {
        return ExecutionStrategy::TextInjection;
    }
    if has_unbalanced_quotes(text) || (has_mixed_quotes(text) && !text.is_ascii()) {
        return ExecutionStrategy::BracketedPaste;
    }
    if has_heredoc(text) {
        return ExecutionStrategy::ScriptFile;
    }
    if is_multiline(text) {
        return ExecutionStrategy::BracketedPaste;
    }
    if PLAIN.is_match(text.trim()) {
        return ExecutionStrategy::Direct;
    }
    ambiguous
}

/// Which texts a strategy can deliver intact.
pub trait StrategyExt {
    /// Whether `text` can be delivered with this strategy.
    fn permits(&self, text: &str) -> bool;
}

impl StrategyExt for ExecutionStrategy {
    fn permits(&self, text: &str) -> bool {
        match self {
            ExecutionStrategy::Direct => {
                !has_heredoc(text) && !is_multiline(text) && !has_control_chars(text)
            }
            // An embedded ESC[201~ would end the paste early
            ExecutionStrategy::BracketedPaste => !text.contains('\x1b'),
            ExecutionStrategy::ScriptFile | ExecutionStrategy::TextInjection => true,
        }
    }
}

/// C0 controls other than newline and tab, plus DEL.
pub fn has_control_chars(text: &str) -> bool {
    text.chars()
        .any(|c| (c < ' ' && c != '\n' && c != '\t') || c == '\x7f')
}

/// Heredoc redirection, excluding here-strings.
pub fn has_heredoc(text: &str) -> bool {
    HEREDOC.is_match(text)
}

/// More than one line, ignoring trailing newlines.
pub fn is_multiline(text: &str) -> bool {
    text.trim_end_matches('\n').contains('\n')
}

/// A quote left open at the end of the text, shell quoting rules.
pub fn has_unbalanced_quotes(text: &str) -> bool {
    let mut quote: Option<char> = None;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => {
                chars.next();
            }
            (Some('"'), '"') => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            _ => {}
        }
    }
    quote.is_some()
}

fn has_mixed_quotes(text: &str) -> bool {
    text.contains('\'') && text.contains('"')
}
