//! Configspec validation.
//!
//! A [`Configspec`] is a config-shaped tree whose leaf values are checks
//! (see [`Check`]). Validating a config walks the spec, converts present
//! values, fills in defaults, applies alias renames, aggregates every
//! failure into one error, and warns about (and prunes) unknown options.

use crate::core::config::check::{Check, CheckDefault};
use crate::core::config::validators::{self, ValidatorContext};
use crate::core::config::{Config, Entry, Value};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::{convert_error_vec, Result};
use std::borrow::Cow;
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Configspec {
    spec: Config,
}

impl Configspec {
    pub fn from_string(text: &str) -> Result<Configspec> {
        Ok(Configspec {
            spec: Config::from_string(text, None)?,
        })
    }

    pub fn from_path(path: &Path) -> Result<Configspec> {
        Ok(Configspec {
            spec: Config::from_path(path)?,
        })
    }

    pub fn root(&self) -> &Config {
        &self.spec
    }

    /// Meld another spec into this one; existing checks win.
    pub fn meld(&mut self, other: Configspec) -> Result<()> {
        self.spec.meld(other.spec)
    }

    /// Validate `config` in place against this spec.
    ///
    /// On success every spec'd option holds a typed value; on failure all
    /// collected validation errors are aggregated into a single error.
    pub fn validate(&self, config: &mut Config, ctx: &ValidatorContext) -> Result<()> {
        let mut errors = Vec::new();
        validate_section(&self.spec, config, ctx, &mut errors);
        convert_error_vec(errors)
    }
}

fn validate_section(
    spec: &Config,
    config: &mut Config,
    ctx: &ValidatorContext,
    errors: &mut Vec<Error>,
) {
    // keys the operator actually wrote, before defaults are filled in;
    // alias resolution must not treat a defaulted canonical as authoritative
    let original_keys: std::collections::HashSet<String> =
        config.keys().map(str::to_string).collect();
    let spec_keys: Vec<String> = spec.keys().map(str::to_string).collect();
    for key in &spec_keys {
        match spec.get(key) {
            Some(Entry::Section(subspec)) => {
                match config.get(key) {
                    Some(Entry::Value(_)) => {
                        errors.push(Error::validation(
                            Cow::from(format!(
                                "expected a [{key}] section but found an option"
                            )),
                            config.span(key).cloned(),
                        ));
                        continue;
                    }
                    Some(Entry::Section(_)) => {}
                    None => {
                        // missing section: validate an empty one so defaults land
                        if let Some(span) = spec.span(key) {
                            config.set_span(key, span.clone());
                        }
                        config.section_or_default(key);
                    }
                }
                if let Some(section) = config.get_section_mut(key) {
                    validate_section(subspec, section, ctx, errors);
                }
            }
            Some(Entry::Value(check_value)) => {
                if let Err(error) =
                    validate_option(spec, key, check_value, config, ctx, &original_keys)
                {
                    errors.push(error);
                }
            }
            None => {}
        }
    }

    prune_unknown(spec, config);
}

fn validate_option(
    spec: &Config,
    key: &str,
    check_value: &Value,
    config: &mut Config,
    ctx: &ValidatorContext,
    original_keys: &std::collections::HashSet<String>,
) -> std::result::Result<(), Error> {
    let check_text = match check_value {
        Value::Str(text) => text,
        other => {
            return Err(Error::validation(
                Cow::from(format!("configspec entry for '{key}' is not a check: {other:?}")),
                spec.span(key).cloned(),
            ))
        }
    };
    let check = Check::parse(check_text, spec.span(key))?;

    let input = match config.get_value(key) {
        Some(value) => value.clone(),
        None => {
            if check.is_alias() {
                tracing::debug!(
                    "skipping alias option '{}' in [{}]: not present",
                    key,
                    config.section_name()
                );
                return Ok(());
            }
            match &check.default {
                Some(CheckDefault::Str(raw)) => Value::Str(raw.clone()),
                Some(CheckDefault::List(items)) => Value::List(items.clone()),
                None => {
                    return Err(Error::validation(
                        Cow::from(format!(
                            "option '{}' in [{}] requires a value",
                            key,
                            config.section_name()
                        )),
                        spec.span(key).cloned(),
                    ))
                }
            }
        }
    };

    let span = config.span(key).or_else(|| spec.span(key)).cloned();
    let converted = validators::apply(&check, input, ctx).map_err(|error| {
        Error::validation(
            Cow::from(format!(
                "[{}] -> {}: {}",
                config.section_name(),
                key,
                error
            )),
            span.clone(),
        )
    })?;

    config.set_value(key, converted);
    if config.span(key).is_none() {
        if let Some(span) = spec.span(key) {
            config.set_span(key, span.clone());
        }
    }

    if let Some(canonical) = &check.aliasof {
        let canonical_written = original_keys.contains(canonical);
        if !canonical_written || config.is_after(key, canonical) {
            config.rename(key, canonical);
        } else {
            config.remove(key);
        }
    }
    Ok(())
}

/// Warn about config entries with no spec counterpart; unknown options are
/// removed from the effective config, unknown sections are left in place for
/// later validation passes (e.g. a strategy spec melded on top).
fn prune_unknown(spec: &Config, config: &mut Config) {
    let unknown: Vec<(String, bool)> = config
        .iter()
        .filter(|(key, _)| spec.get(key).is_none())
        .map(|(key, entry)| (key.to_string(), matches!(entry, Entry::Section(_))))
        .collect();
    for (key, is_section) in unknown {
        let span = config
            .span(&key)
            .map(|span| span.to_string())
            .unwrap_or_default();
        if is_section {
            tracing::warn!("Unknown section [{}] {}", key, span);
        } else {
            tracing::warn!(
                "Unknown option '{}' in [{}] {}",
                key,
                config.section_name(),
                span
            );
            config.remove(&key);
        }
    }
}
