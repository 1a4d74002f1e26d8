//! Spelling variants of a goal, as they tend to appear in markup.

/// The forms a goal like `"Sign In"` takes in ids, names, classes and test
/// hooks, plus the escaped literal used inside quoted attribute values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalVariants {
    /// Original goal, whitespace collapsed.
    pub literal: String,
    /// `literal` escaped for use inside `[attr="..."]`.
    pub escaped: String,
    pub lower: String,
    pub kebab: String,
    pub snake: String,
    pub camel: String,
}

impl GoalVariants {
    pub fn new(goal: &str) -> Self {
        let words = split_words(goal);
        let literal = goal.split_whitespace().collect::<Vec<_>>().join(" ");
        let lower_words: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
        let camel = lower_words
            .iter()
            .enumerate()
            .map(|(idx, word)| if idx == 0 { word.clone() } else { capitalize(word) })
            .collect::<String>();
        Self {
            escaped: escape_attribute(&literal),
            lower: literal.to_lowercase(),
            kebab: lower_words.join("-"),
            snake: lower_words.join("_"),
            camel,
            literal,
        }
    }

    /// Distinct identifier-like spellings, most conventional first.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for candidate in [
            self.kebab.as_str(),
            self.snake.as_str(),
            self.camel.as_str(),
            self.lower.as_str(),
        ] {
            if !candidate.is_empty() && !candidate.contains(' ') && !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out
    }
}

/// Split on whitespace, punctuation and camelCase humps.
fn split_words(goal: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in goal.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_numeric();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn escape_attribute(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' | '\r' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

/// True when `value` can follow `#` in a CSS selector without escaping.
pub fn is_plain_ident(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        _ => false,
    }
}
