//! Client-rule matching with optional Arabic-orthography normalization

use groupcast_config::ClientRule;
use unicode_normalization::UnicodeNormalization;

/// Canonical form used for matching Arabic names.
///
/// Decomposes (NFD), drops harakat, superscript alef, tatweel and
/// bidi/zero-width marks, unifies alef/yeh/teh-marbuta variants, folds
/// Arabic-Indic digits to ASCII, turns punctuation into spaces, collapses
/// whitespace and lowercases.
pub fn normalize_arabic(input: &str) -> String {
    let mut folded = String::with_capacity(input.len());
    for ch in input.nfd() {
        match ch {
            '\u{064B}'..='\u{065F}' | '\u{0670}' | '\u{0640}' => {}
            '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' => {}
            '\u{FEFF}' => {}
            'أ' | 'إ' | 'آ' | 'ٱ' => folded.push('ا'),
            'ى' | 'ئ' => folded.push('ي'),
            'ؤ' => folded.push('و'),
            'ة' => folded.push('ه'),
            '\u{0660}'..='\u{0669}' => folded.push(fold_digit(ch, '\u{0660}')),
            '\u{06F0}'..='\u{06F9}' => folded.push(fold_digit(ch, '\u{06F0}')),
            c if c.is_alphanumeric() || c.is_whitespace() => folded.push(c),
            c if is_combining_mark(c) => folded.push(c),
            _ => folded.push(' '),
        }
    }

    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn fold_digit(ch: char, zero: char) -> char {
    let offset = ch as u32 - zero as u32;
    char::from_digit(offset, 10).unwrap_or(ch)
}

// Latin accents survive NFD as combining marks; keep them so both sides stay comparable.
fn is_combining_mark(ch: char) -> bool {
    matches!(ch, '\u{0300}'..='\u{036F}' | '\u{1AB0}'..='\u{1AFF}' | '\u{1DC0}'..='\u{1DFF}' | '\u{20D0}'..='\u{20FF}')
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: ClientRule,
    needle: String,
}

/// First-match substring matcher over an ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct TextMatcher {
    rules: Vec<CompiledRule>,
    normalize: bool,
}

impl TextMatcher {
    pub fn new(rules: &[ClientRule], normalize: bool) -> Self {
        let rules = rules
            .iter()
            .filter_map(|rule| {
                let needle = Self::canonical(&rule.name, normalize);
                if needle.is_empty() {
                    tracing::warn!("Ignoring client rule '{}': empty after normalization", rule.name);
                    return None;
                }
                Some(CompiledRule {
                    rule: rule.clone(),
                    needle,
                })
            })
            .collect();
        Self { rules, normalize }
    }

    fn canonical(text: &str, normalize: bool) -> String {
        if normalize {
            normalize_arabic(text)
        } else {
            text.to_lowercase()
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The first rule, in configuration order, whose name occurs in `text`.
    pub fn find(&self, text: &str) -> Option<&ClientRule> {
        if text.trim().is_empty() {
            return None;
        }
        let haystack = Self::canonical(text, self.normalize);
        self.rules
            .iter()
            .find(|compiled| haystack.contains(&compiled.needle))
            .map(|compiled| &compiled.rule)
    }
}
