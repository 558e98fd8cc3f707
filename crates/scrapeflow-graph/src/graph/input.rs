use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Boolean requirement over state key names.
///
/// Grammar: `expr := term ('|' term)*`, `term := atom ('&' atom)*`,
/// `atom := KEY | '(' expr ')'`. `&` binds tighter than `|`. The empty
/// expression requires nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputExpr {
    Key(String),
    And(Vec<InputExpr>),
    Or(Vec<InputExpr>),
}

impl InputExpr {
    pub fn key(name: impl Into<String>) -> Self {
        Self::Key(name.into())
    }

    /// Every key name mentioned by the expression.
    pub fn keys(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_keys(&mut out);
        out
    }

    fn collect_keys<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::Key(k) => {
                out.insert(k.as_str());
            }
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_keys(out);
                }
            }
        }
    }

    pub fn is_satisfied_by(&self, has: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Self::Key(k) => has(k),
            Self::And(items) => items.iter().all(|i| i.is_satisfied_by(has)),
            Self::Or(items) => items.iter().any(|i| i.is_satisfied_by(has)),
        }
    }

    /// Keys actually read when the expression is satisfied, in expression
    /// order. An `Or` picks its leftmost satisfied alternative.
    pub fn resolve(&self, has: &dyn Fn(&str) -> bool) -> Option<Vec<String>> {
        match self {
            Self::Key(k) => has(k).then(|| vec![k.clone()]),
            Self::And(items) => {
                let mut keys = Vec::new();
                for item in items {
                    keys.extend(item.resolve(has)?);
                }
                Some(keys)
            }
            Self::Or(items) => items.iter().find_map(|i| i.resolve(has)),
        }
    }
}

impl fmt::Display for InputExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_group(
            f: &mut fmt::Formatter<'_>,
            items: &[InputExpr],
            sep: &str,
            wrap_or: bool,
        ) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", sep)?;
                }
                match item {
                    InputExpr::Or(_) if wrap_or => write!(f, "({})", item)?,
                    _ => write!(f, "{}", item)?,
                }
            }
            Ok(())
        }

        match self {
            Self::Key(k) => write!(f, "{}", k),
            Self::And(items) => write_group(f, items, "&", true),
            Self::Or(items) => write_group(f, items, "|", false),
        }
    }
}

impl FromStr for InputExpr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        if tokens.is_empty() {
            // No requirement at all
            return Ok(Self::And(vec![]));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some(tok) => Err(format!("unexpected '{}'", tok)),
        }
    }
}

impl Serialize for InputExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InputExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Key(String),
    And,
    Or,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Key(k) => write!(f, "{}", k),
            Token::And => write!(f, "&"),
            Token::Or => write!(f, "|"),
            Token::Open => write!(f, "("),
            Token::Close => write!(f, ")"),
        }
    }
}

fn tokenize(s: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '&' => {
                chars.next();
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                let mut key = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                        key.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Key(key));
            }
            other => return Err(format!("invalid character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<InputExpr, String> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(collapse(items, InputExpr::Or))
    }

    fn parse_and(&mut self) -> Result<InputExpr, String> {
        let mut items = vec![self.parse_atom()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.parse_atom()?);
        }
        Ok(collapse(items, InputExpr::And))
    }

    fn parse_atom(&mut self) -> Result<InputExpr, String> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match token {
            Some(Token::Key(k)) => Ok(InputExpr::Key(k)),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err("unbalanced parenthesis".into());
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(other) => Err(format!("expected a key, found '{}'", other)),
            None => Err("expression ends with an operator".into()),
        }
    }
}

fn collapse(mut items: Vec<InputExpr>, wrap: fn(Vec<InputExpr>) -> InputExpr) -> InputExpr {
    if items.len() == 1 {
        items.remove(0)
    } else {
        wrap(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has(keys: &'static [&'static str]) -> impl Fn(&str) -> bool {
        move |k| keys.contains(&k)
    }

    #[test]
    fn test_parse_precedence() {
        let expr: InputExpr = "doc & (url | local_dir)".parse().unwrap();
        assert_eq!(
            expr,
            InputExpr::And(vec![
                InputExpr::key("doc"),
                InputExpr::Or(vec![InputExpr::key("url"), InputExpr::key("local_dir")]),
            ])
        );

        let expr: InputExpr = "a & b | c".parse().unwrap();
        assert_eq!(
            expr,
            InputExpr::Or(vec![
                InputExpr::And(vec![InputExpr::key("a"), InputExpr::key("b")]),
                InputExpr::key("c"),
            ])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("doc &".parse::<InputExpr>().is_err());
        assert!("(doc | url".parse::<InputExpr>().is_err());
        assert!("doc url".parse::<InputExpr>().is_err());
        assert!("doc == 1".parse::<InputExpr>().is_err());
    }

    #[test]
    fn test_empty_expression_is_always_satisfied() {
        let expr: InputExpr = "  ".parse().unwrap();
        assert!(expr.is_satisfied_by(&has(&[])));
        assert_eq!(expr.resolve(&has(&[])), Some(vec![]));
        assert_eq!(expr.to_string(), "");
    }

    #[test]
    fn test_display_round_trip() {
        for src in ["doc", "doc & (url | local_dir)", "a | b & c", "user_prompt & (relevant_chunks | parsed_doc | doc)"] {
            let expr: InputExpr = src.parse().unwrap();
            let again: InputExpr = expr.to_string().parse().unwrap();
            assert_eq!(expr, again, "{}", src);
        }
    }

    #[test]
    fn test_satisfaction() {
        let expr: InputExpr = "doc & (url | local_dir)".parse().unwrap();
        assert!(expr.is_satisfied_by(&has(&["doc", "url"])));
        assert!(expr.is_satisfied_by(&has(&["doc", "local_dir"])));
        assert!(!expr.is_satisfied_by(&has(&["doc"])));
        assert!(!expr.is_satisfied_by(&has(&["url", "local_dir"])));
    }

    #[test]
    fn test_resolve_prefers_leftmost_alternative() {
        let expr: InputExpr = "user_prompt & (parsed_doc | doc)".parse().unwrap();
        assert_eq!(
            expr.resolve(&has(&["user_prompt", "parsed_doc", "doc"])),
            Some(vec!["user_prompt".to_string(), "parsed_doc".to_string()])
        );
        assert_eq!(
            expr.resolve(&has(&["user_prompt", "doc"])),
            Some(vec!["user_prompt".to_string(), "doc".to_string()])
        );
        assert_eq!(expr.resolve(&has(&["doc"])), None);
    }

    #[test]
    fn test_keys() {
        let expr: InputExpr = "doc & (url | doc)".parse().unwrap();
        assert_eq!(expr.keys().into_iter().collect::<Vec<_>>(), vec!["doc", "url"]);
    }

    #[test]
    fn test_serde_as_string() {
        let expr: InputExpr = "doc & (url | local_dir)".parse().unwrap();
        let json = serde_json::to_string(&expr).unwrap();
        assert_eq!(json, "\"doc & (url | local_dir)\"");
        let parsed: InputExpr = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, expr);
    }
}
