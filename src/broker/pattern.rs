//! Wildcard topic patterns
//!
//! Topic names are dot-separated. A pattern may use:
//! - `*`: exactly one name segment made of letters, digits, `$` or `_`
//! - `**`: one or more characters of any segment(s)
//! - `>`: (last position only) the rest of the name, which is either empty or
//!   starts with a `.`; `*>` requires at least one further segment
//!
//! Patterns are validated when parsed: a wildcard must be surrounded by dots,
//! `>` may not follow a dot, and the name may not start or end with a dot or
//! contain `..`.

use crate::utils::{BrokerError, Result};

pub fn is_wildcard(name: &str) -> bool {
    name.contains('*') || name.contains('>')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Star,
    DoubleStar,
    Rest { after_star: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    source: String,
    tokens: Vec<Token>,
}

fn invalid(pattern: &str, reason: &'static str) -> BrokerError {
    BrokerError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    }
}

impl WildcardPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut dot = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match c {
                '*' => {
                    if i != 0 && !dot {
                        return Err(invalid(pattern, "wildcard should be surrounded by ."));
                    }
                    let double = chars.get(i + 1) == Some(&'*');
                    if double {
                        i += 1;
                    }
                    if let Some(next) = chars.get(i + 1) {
                        if *next != '.' && *next != '>' {
                            return Err(invalid(pattern, "wildcard should be surrounded by ."));
                        }
                    }
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(if double { Token::DoubleStar } else { Token::Star });
                    dot = false;
                }
                '>' => {
                    if dot {
                        return Err(invalid(pattern, "wildcard should never be preceded by ."));
                    }
                    if i != chars.len() - 1 {
                        return Err(invalid(pattern, "> must be the last character"));
                    }
                    let after_star = i > 0 && chars[i - 1] == '*';
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Rest { after_star });
                    dot = false;
                }
                '.' => {
                    if i == 0 {
                        return Err(invalid(pattern, "name starts with ."));
                    }
                    if i == chars.len() - 1 {
                        return Err(invalid(pattern, "name ends with ."));
                    }
                    if dot {
                        return Err(invalid(pattern, "name contains .."));
                    }
                    dot = true;
                    literal.push('.');
                }
                other => {
                    dot = false;
                    literal.push(other);
                }
            }
            i += 1;
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &str) -> bool {
        let chars: Vec<char> = name.chars().collect();
        // `>` alone matches every name
        if let [Token::Rest { .. }] = self.tokens.as_slice() {
            return !chars.is_empty() && !chars.iter().any(|c| c.is_whitespace());
        }
        match_tokens(&self.tokens, &chars)
    }
}

fn is_segment_char(c: char) -> bool {
    c.is_alphanumeric() || c == '$' || c == '_'
}

fn match_tokens(tokens: &[Token], name: &[char]) -> bool {
    let Some((first, remaining)) = tokens.split_first() else {
        return name.is_empty();
    };

    match first {
        Token::Literal(lit) => {
            let lit: Vec<char> = lit.chars().collect();
            name.starts_with(&lit) && match_tokens(remaining, &name[lit.len()..])
        }
        Token::Star => {
            let run = name.iter().take_while(|c| is_segment_char(**c)).count();
            (1..=run).rev().any(|n| match_tokens(remaining, &name[n..]))
        }
        Token::DoubleStar => {
            let run = name.iter().take_while(|c| !c.is_whitespace()).count();
            (1..=run).rev().any(|n| match_tokens(remaining, &name[n..]))
        }
        Token::Rest { after_star } => {
            if name.iter().any(|c| c.is_whitespace()) {
                return false;
            }
            if *after_star {
                name.first() == Some(&'.')
            } else {
                name.is_empty() || name[0] == '.'
            }
        }
    }
}
