//! The closed set of validators backing configspec checks.
//!
//! Each validator converts a raw string value (or passes through an already
//! typed value on re-validation) into a typed [`Value`], or fails with a
//! message suitable for attaching provenance to.

use crate::core::config::check::Check;
use crate::core::config::{unquote, LogLevel, Value};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use std::borrow::Cow;

/// Names the registry-backed method sets consulted by the `compression` and
/// `archive_method` checks.
#[derive(Clone, Debug)]
pub struct ValidatorContext {
    pub compression_methods: Vec<String>,
    pub archive_methods: Vec<String>,
}

impl Default for ValidatorContext {
    fn default() -> Self {
        ValidatorContext {
            compression_methods: crate::core::stream::builtin_method_names(),
            archive_methods: crate::core::archive::builtin_archiver_names(),
        }
    }
}

fn invalid(message: String) -> Error {
    Error::validation(Cow::from(message), None)
}

/// Apply `check` to `input`, producing the converted value.
pub fn apply(check: &Check, input: Value, ctx: &ValidatorContext) -> Result<Value> {
    match check.name.as_str() {
        "boolean" => boolean(input),
        "integer" => integer(check, input),
        "float" => float(input),
        "percent" => percent(input),
        "string" => string(input),
        "option" => option(check, input),
        "list" | "force_list" | "tuple" => list(input, false),
        "set" => list(input, true),
        "namearg" => namearg(input),
        "cmdline" => cmdline(input),
        "log_level" => log_level(input),
        "compression" => method_option(input, &ctx.compression_methods, "compression"),
        "archive_method" => method_option(input, &ctx.archive_methods, "archiving"),
        other => Err(invalid(format!("unknown validation check '{other}'"))),
    }
}

fn boolean(input: Value) -> Result<Value> {
    match input {
        Value::Bool(_) => Ok(input),
        Value::Str(s) => match unquote(&s).to_ascii_lowercase().as_str() {
            "yes" | "on" | "true" | "1" => Ok(Value::Bool(true)),
            "no" | "off" | "false" | "0" => Ok(Value::Bool(false)),
            other => Err(invalid(format!("invalid boolean '{other}'"))),
        },
        other => Err(invalid(format!("invalid boolean {other:?}"))),
    }
}

fn integer(check: &Check, input: Value) -> Result<Value> {
    let parse_bound = |key: &str| -> Result<Option<i64>> {
        match check.kwargs.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| invalid(format!("invalid {key} bound '{raw}' in integer check"))),
        }
    };

    let value = match input {
        Value::Int(i) => i,
        Value::Str(s) => {
            let s = unquote(&s);
            let base: u32 = match check.kwargs.get("base") {
                None => 10,
                Some(raw) => raw
                    .parse()
                    .map_err(|_| invalid(format!("invalid base '{raw}' in integer check")))?,
            };
            i64::from_str_radix(s.trim(), base)
                .map_err(|_| invalid(format!("invalid integer '{s}'")))?
        }
        other => return Err(invalid(format!("invalid integer {other:?}"))),
    };

    if let Some(min) = parse_bound("min")? {
        if value < min {
            return Err(invalid(format!("integer value {value} must be >= {min}")));
        }
    }
    if let Some(max) = parse_bound("max")? {
        if value > max {
            return Err(invalid(format!(
                "integer value {value} exceeds maximum {max}"
            )));
        }
    }
    Ok(Value::Int(value))
}

fn float(input: Value) -> Result<Value> {
    match input {
        Value::Float(_) => Ok(input),
        Value::Int(i) => Ok(Value::Float(i as f64)),
        Value::Str(s) => {
            let s = unquote(&s);
            s.trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| invalid(format!("invalid float '{s}'")))
        }
        other => Err(invalid(format!("invalid float {other:?}"))),
    }
}

fn percent(input: Value) -> Result<Value> {
    match input {
        Value::Percent(_) => Ok(input),
        Value::Float(x) => Ok(Value::Percent(x)),
        Value::Str(s) => {
            let s = unquote(&s);
            let number = s.trim().strip_suffix('%').unwrap_or(s.trim());
            number
                .parse::<f64>()
                .map(|x| Value::Percent(x / 100.0))
                .map_err(|_| invalid(format!("invalid percent '{s}'")))
        }
        other => Err(invalid(format!("invalid percent {other:?}"))),
    }
}

fn string(input: Value) -> Result<Value> {
    match input {
        Value::Str(s) => Ok(Value::Str(unquote(&s))),
        other => Err(invalid(format!("invalid string {other:?}"))),
    }
}

fn option(check: &Check, input: Value) -> Result<Value> {
    let value = match input {
        Value::Str(s) => unquote(&s),
        other => return Err(invalid(format!("invalid option {other:?}"))),
    };
    if check.args.iter().any(|allowed| allowed == &value) {
        Ok(Value::Str(value))
    } else {
        Err(invalid(format!(
            "invalid option '{}' - choose from: {}",
            value,
            check.args.join(",")
        )))
    }
}

fn list(input: Value, dedup: bool) -> Result<Value> {
    let mut items = match input {
        Value::List(items) => items,
        Value::Str(s) => split_csv(&s),
        other => return Err(invalid(format!("invalid list {other:?}"))),
    };
    if dedup {
        let mut seen = std::collections::HashSet::new();
        items.retain(|item| seen.insert(item.clone()));
    }
    Ok(Value::List(items))
}

fn namearg(input: Value) -> Result<Value> {
    match input {
        Value::NameArg { .. } => Ok(input),
        Value::Str(s) => {
            let s = unquote(&s);
            let (name, arg) = s.split_once(':').unwrap_or((s.as_str(), ""));
            Ok(Value::NameArg {
                name: name.to_string(),
                arg: arg.to_string(),
            })
        }
        other => Err(invalid(format!("invalid name:arg pair {other:?}"))),
    }
}

fn cmdline(input: Value) -> Result<Value> {
    match input {
        Value::Cmdline(_) => Ok(input),
        Value::List(argv) => Ok(Value::Cmdline(argv)),
        Value::Str(s) => {
            let s = unquote(&s);
            if s.trim().is_empty() {
                return Ok(Value::Cmdline(vec![]));
            }
            shlex::split(&s)
                .map(Value::Cmdline)
                .ok_or_else(|| invalid(format!("invalid command line '{s}'")))
        }
        other => Err(invalid(format!("invalid command line {other:?}"))),
    }
}

fn log_level(input: Value) -> Result<Value> {
    match input {
        Value::LogLevel(_) => Ok(input),
        Value::Int(i) => LogLevel::from_int(i)
            .map(Value::LogLevel)
            .ok_or_else(|| invalid(format!("invalid log level '{i}'"))),
        Value::Str(s) => {
            let s = unquote(&s);
            LogLevel::from_name(&s)
                .map(Value::LogLevel)
                .ok_or_else(|| invalid(format!("invalid log level '{s}'")))
        }
        other => Err(invalid(format!("invalid log level {other:?}"))),
    }
}

fn method_option(input: Value, available: &[String], what: &str) -> Result<Value> {
    let value = match input {
        Value::Str(s) => unquote(&s),
        other => return Err(invalid(format!("invalid {what} method {other:?}"))),
    };
    if available.iter().any(|name| name == &value) {
        Ok(Value::Str(value))
    } else {
        Err(invalid(format!(
            "invalid {what} method '{}'. Available methods: {}",
            value,
            available.join(",")
        )))
    }
}

/// Split a comma-separated value list, honoring quoted cells.
fn split_csv(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in raw.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    current.push(c);
                    quote = Some(c);
                }
                ',' => {
                    let cell = current.trim();
                    if !cell.is_empty() {
                        items.push(unquote(cell));
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    let cell = current.trim();
    if !cell.is_empty() {
        items.push(unquote(cell));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ValidatorContext {
        ValidatorContext {
            compression_methods: vec!["gzip".to_string(), "lzop".to_string()],
            archive_methods: vec!["tar".to_string(), "dircopy".to_string()],
        }
    }

    fn check(text: &str) -> Check {
        Check::parse(text, None).unwrap()
    }

    fn str_value(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    #[test]
    fn test_boolean_conversions() {
        let truthy = ["yes", "on", "true", "1", "YES"];
        let falsy = ["no", "off", "false", "0", "No"];
        for raw in truthy {
            assert_eq!(
                apply(&check("boolean"), str_value(raw), &ctx()).unwrap(),
                Value::Bool(true),
                "input {raw}"
            );
        }
        for raw in falsy {
            assert_eq!(
                apply(&check("boolean"), str_value(raw), &ctx()).unwrap(),
                Value::Bool(false),
                "input {raw}"
            );
        }
        assert!(apply(&check("boolean"), str_value("maybe"), &ctx()).is_err());
    }

    #[test]
    fn test_integer_conversion_and_bounds() {
        let c = check("integer(min=0, max=9)");
        assert_eq!(apply(&c, str_value("5"), &ctx()).unwrap(), Value::Int(5));
        assert!(apply(&c, str_value("-1"), &ctx()).is_err());
        assert!(apply(&c, str_value("10"), &ctx()).is_err());
        assert!(apply(&c, str_value("abc"), &ctx()).is_err());
    }

    #[test]
    fn test_integer_base() {
        let c = check("integer(base=8)");
        assert_eq!(apply(&c, str_value("0022"), &ctx()).unwrap(), Value::Int(18));
    }

    #[test]
    fn test_float_and_percent() {
        assert_eq!(
            apply(&check("float"), str_value("1.5"), &ctx()).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            apply(&check("percent"), str_value("75%"), &ctx()).unwrap(),
            Value::Percent(0.75)
        );
        assert_eq!(
            apply(&check("percent"), str_value("100"), &ctx()).unwrap(),
            Value::Percent(1.0)
        );
    }

    #[test]
    fn test_string_unquotes() {
        assert_eq!(
            apply(&check("string"), str_value("\"hello world\""), &ctx()).unwrap(),
            Value::Str("hello world".to_string())
        );
    }

    #[test]
    fn test_option_membership() {
        let c = check("option(md5, sha1, none)");
        assert_eq!(
            apply(&c, str_value("sha1"), &ctx()).unwrap(),
            Value::Str("sha1".to_string())
        );
        assert!(apply(&c, str_value("sha512"), &ctx()).is_err());
    }

    #[test]
    fn test_list_parsing() {
        assert_eq!(
            apply(&check("list"), str_value("a, b, \"c,d\""), &ctx()).unwrap(),
            Value::List(vec!["a".to_string(), "b".to_string(), "c,d".to_string()])
        );
        // force_list behaves identically
        assert_eq!(
            apply(&check("force_list"), str_value("x"), &ctx()).unwrap(),
            Value::List(vec!["x".to_string()])
        );
    }

    #[test]
    fn test_set_dedups() {
        assert_eq!(
            apply(&check("set"), str_value("a, b, a"), &ctx()).unwrap(),
            Value::List(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_namearg_split() {
        assert_eq!(
            apply(&check("namearg"), str_value("directory:/var/lib"), &ctx()).unwrap(),
            Value::NameArg {
                name: "directory".to_string(),
                arg: "/var/lib".to_string()
            }
        );
        assert_eq!(
            apply(&check("namearg"), str_value("plugin"), &ctx()).unwrap(),
            Value::NameArg {
                name: "plugin".to_string(),
                arg: String::new()
            }
        );
    }

    #[test]
    fn test_cmdline_tokenization() {
        assert_eq!(
            apply(&check("cmdline"), str_value("tar -cf - 'my dir'"), &ctx()).unwrap(),
            Value::Cmdline(vec![
                "tar".to_string(),
                "-cf".to_string(),
                "-".to_string(),
                "my dir".to_string()
            ])
        );
        assert_eq!(
            apply(&check("cmdline"), str_value(""), &ctx()).unwrap(),
            Value::Cmdline(vec![])
        );
    }

    #[test]
    fn test_log_level() {
        assert_eq!(
            apply(&check("log_level"), str_value("warning"), &ctx()).unwrap(),
            Value::LogLevel(LogLevel::Warning)
        );
        assert!(apply(&check("log_level"), str_value("verbose"), &ctx()).is_err());
    }

    #[test]
    fn test_compression_method_membership() {
        assert_eq!(
            apply(&check("compression"), str_value("gzip"), &ctx()).unwrap(),
            Value::Str("gzip".to_string())
        );
        assert!(apply(&check("compression"), str_value("zstd"), &ctx()).is_err());
    }

    #[test]
    fn test_archive_method_membership() {
        assert_eq!(
            apply(&check("archive_method"), str_value("tar"), &ctx()).unwrap(),
            Value::Str("tar".to_string())
        );
        assert!(apply(&check("archive_method"), str_value("cpio"), &ctx()).is_err());
    }

    #[test]
    fn test_unknown_check_name() {
        assert!(apply(&check("frobnicate"), str_value("x"), &ctx()).is_err());
    }

    #[test]
    fn test_revalidation_passes_typed_values() {
        assert_eq!(
            apply(&check("boolean"), Value::Bool(true), &ctx()).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            apply(&check("integer(min=1)"), Value::Int(3), &ctx()).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            apply(&check("percent"), Value::Percent(0.5), &ctx()).unwrap(),
            Value::Percent(0.5)
        );
    }
}
