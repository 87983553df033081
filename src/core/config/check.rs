//! Parsing of configspec checks.
//!
//! A check is the leaf value of a configspec entry, e.g.
//! `integer(min=0, max=9, default=1)` or
//! `additional-args = cmdline(default=list(), aliasof='options')`. The check
//! names a validator, positional args, keyword args, an optional default and
//! an optional alias target.

use crate::core::config::{unquote, Span};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use indexmap::IndexMap;
use std::borrow::Cow;

/// Default value carried by a check.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckDefault {
    Str(String),
    /// `default=list(...)`; empty parens mean an empty list default.
    List(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Check {
    pub name: String,
    pub args: Vec<String>,
    pub kwargs: IndexMap<String, String>,
    pub default: Option<CheckDefault>,
    pub aliasof: Option<String>,
}

impl Check {
    pub fn is_alias(&self) -> bool {
        self.aliasof.is_some()
    }

    /// Parse a check string. `span` is attached to any syntax error.
    pub fn parse(text: &str, span: Option<&Span>) -> Result<Check> {
        let text = text.trim();
        let syntax_error = |reason: String| {
            Error::validation(
                Cow::from(format!("malformed check '{text}': {reason}")),
                span.cloned(),
            )
        };

        let (name, params) = match text.find('(') {
            None => (text, None),
            Some(open) => {
                if !text.ends_with(')') {
                    return Err(syntax_error("missing closing parenthesis".into()));
                }
                (&text[..open], Some(&text[open + 1..text.len() - 1]))
            }
        };
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(syntax_error(format!("invalid check name {name:?}")));
        }

        let mut check = Check {
            name: name.to_string(),
            ..Check::default()
        };
        let Some(params) = params else {
            return Ok(check);
        };

        for param in split_params(params) {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match split_kwarg(param) {
                Some((key, raw)) => {
                    let key = key.trim();
                    let raw = raw.trim();
                    match key {
                        "default" => check.default = Some(parse_default(raw)),
                        "aliasof" => check.aliasof = Some(unquote(raw)),
                        _ => {
                            check.kwargs.insert(key.to_string(), unquote(raw));
                        }
                    }
                }
                None => check.args.push(unquote(param)),
            }
        }
        Ok(check)
    }
}

fn parse_default(raw: &str) -> CheckDefault {
    if let Some(inner) = raw.strip_prefix("list(").and_then(|r| r.strip_suffix(')')) {
        let items = split_params(inner)
            .into_iter()
            .map(|item| unquote(item.trim()))
            .filter(|item| !item.is_empty())
            .collect();
        CheckDefault::List(items)
    } else {
        CheckDefault::Str(unquote(raw))
    }
}

/// Split a parameter list on top-level commas, honoring quotes and parens.
fn split_params(params: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    for (idx, c) in params.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    pieces.push(&params[start..idx]);
                    start = idx + 1;
                }
                _ => {}
            },
        }
    }
    if start < params.len() {
        pieces.push(&params[start..]);
    }
    pieces
}

/// Split `key=value` at a top-level `=`; returns None for positional args.
fn split_kwarg(param: &str) -> Option<(&str, &str)> {
    let mut quote: Option<char> = None;
    for (idx, c) in param.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '=' => {
                    let key = &param[..idx];
                    if key
                        .trim()
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                        && !key.trim().is_empty()
                    {
                        return Some((key, &param[idx + 1..]));
                    }
                    return None;
                }
                _ => {}
            },
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_check() {
        let check = Check::parse("string", None).unwrap();
        assert_eq!(check.name, "string");
        assert!(check.args.is_empty());
        assert!(check.default.is_none());
    }

    #[test]
    fn test_check_with_kwargs() {
        let check = Check::parse("integer(min=0, max=9, default=1)", None).unwrap();
        assert_eq!(check.name, "integer");
        assert_eq!(check.kwargs.get("min").map(String::as_str), Some("0"));
        assert_eq!(check.kwargs.get("max").map(String::as_str), Some("9"));
        assert_eq!(check.default, Some(CheckDefault::Str("1".to_string())));
    }

    #[test]
    fn test_check_with_positional_args() {
        let check = Check::parse("option(md5, sha1, sha256, default=sha256)", None).unwrap();
        assert_eq!(check.args, vec!["md5", "sha1", "sha256"]);
        assert_eq!(check.default, Some(CheckDefault::Str("sha256".to_string())));
    }

    #[test]
    fn test_check_quoted_args() {
        let check = Check::parse("option('a b', \"c,d\")", None).unwrap();
        assert_eq!(check.args, vec!["a b", "c,d"]);
    }

    #[test]
    fn test_check_default_list() {
        let check = Check::parse("force_list(default=list())", None).unwrap();
        assert_eq!(check.default, Some(CheckDefault::List(vec![])));

        let check = Check::parse("force_list(default=list('a', 'b'))", None).unwrap();
        assert_eq!(
            check.default,
            Some(CheckDefault::List(vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn test_check_aliasof() {
        let check = Check::parse("cmdline(default=list(), aliasof='options')", None).unwrap();
        assert!(check.is_alias());
        assert_eq!(check.aliasof.as_deref(), Some("options"));
        assert_eq!(check.default, Some(CheckDefault::List(vec![])));
    }

    #[test]
    fn test_malformed_checks() {
        for text in ["integer(min=0", "(x)", "bad name(x)", ""] {
            assert!(Check::parse(text, None).is_err(), "{text:?} should fail");
        }
    }
}
