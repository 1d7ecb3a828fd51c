//! Environment variable interpolation for config files.
//!
//! Supports the following syntax:
//! - `$VAR` or `${VAR}` - substitute with env var value, error if missing
//! - `${VAR:-default}` - use default if VAR is unset OR empty
//! - `${VAR-default}` - use default only if VAR is unset (empty is OK)
//! - `$$` - escape sequence for literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?: (?P<op>:?-) (?P<default>[^}]*) )?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("Invalid regex pattern")
});

/// Interpolate environment variables in the given text.
///
/// Every problem is collected so the user sees all missing variables at once.
/// On failure the returned messages are in order of appearance.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| substitute(caps, &mut errors))
        .into_owned();

    if errors.is_empty() {
        Ok(text)
    } else {
        Err(errors)
    }
}

fn substitute(caps: &Captures, errors: &mut Vec<String>) -> String {
    if caps.name("escape").is_some() {
        return "$".to_string();
    }

    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return caps[0].to_string();
    };
    let name = name.as_str();
    let op = caps.name("op").map(|m| m.as_str());
    let default = caps.name("default").map(|m| m.as_str());

    match env::var(name) {
        Ok(value) if value.contains('\n') || value.contains('\r') => {
            errors.push(format!(
                "environment variable '{name}' contains newlines, which is not allowed"
            ));
            caps[0].to_string()
        }
        Ok(value) if value.is_empty() && op == Some(":-") => default.unwrap_or("").to_string(),
        Ok(value) => value,
        Err(_) => match default {
            Some(default) => default.to_string(),
            None => {
                errors.push(format!("environment variable '{name}' is not set"));
                caps[0].to_string()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names so they can run in parallel.
    fn set(key: &str, value: &str) {
        // SAFETY: variable names are unique per test
        unsafe { env::set_var(key, value) };
    }

    fn unset(key: &str) {
        // SAFETY: variable names are unique per test
        unsafe { env::remove_var(key) };
    }

    #[test]
    fn test_bare_and_braced_substitution() {
        set("SNOWDRIFT_TEST_BUCKET", "warehouse");
        let text = interpolate("url: s3://$SNOWDRIFT_TEST_BUCKET/${SNOWDRIFT_TEST_BUCKET}").unwrap();
        assert_eq!(text, "url: s3://warehouse/warehouse");
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        unset("SNOWDRIFT_TEST_MISSING_A");
        unset("SNOWDRIFT_TEST_MISSING_B");
        let errors = interpolate("a: $SNOWDRIFT_TEST_MISSING_A\nb: ${SNOWDRIFT_TEST_MISSING_B}")
            .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("SNOWDRIFT_TEST_MISSING_A"));
        assert!(errors[1].contains("not set"));
    }

    #[test]
    fn test_colon_default_applies_to_empty() {
        set("SNOWDRIFT_TEST_EMPTY_COLON", "");
        let text = interpolate("hour: ${SNOWDRIFT_TEST_EMPTY_COLON:-3}").unwrap();
        assert_eq!(text, "hour: 3");
    }

    #[test]
    fn test_dash_default_keeps_empty() {
        set("SNOWDRIFT_TEST_EMPTY_DASH", "");
        let text = interpolate("hour: '${SNOWDRIFT_TEST_EMPTY_DASH-3}'").unwrap();
        assert_eq!(text, "hour: ''");

        unset("SNOWDRIFT_TEST_UNSET_DASH");
        let text = interpolate("hour: ${SNOWDRIFT_TEST_UNSET_DASH-3}").unwrap();
        assert_eq!(text, "hour: 3");
    }

    #[test]
    fn test_newline_values_rejected() {
        set("SNOWDRIFT_TEST_NEWLINE", "a\nb: c");
        let errors = interpolate("v: $SNOWDRIFT_TEST_NEWLINE").unwrap_err();
        assert!(errors[0].contains("newlines"));
    }

    #[test]
    fn test_escape_sequence() {
        assert_eq!(interpolate("price: $$100").unwrap(), "price: $100");
    }
}
