use once_cell::sync::Lazy;
use regex::Regex;
use relay_core::{RelayError, Result};
use serde_json::Value;
use std::env;

// Matches ${VAR} and ${VAR:-default}
static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("Invalid regex pattern")
});

/// Recursively substitute environment variables in every string of a JSON value
pub fn substitute_env_vars(value: &mut Value) -> Result<()> {
    let mut missing = Vec::new();
    substitute_recursive(value, &mut missing);

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(RelayError::ConfigError(format!(
            "Missing required environment variables: {}. Please set these variables before loading the configuration.",
            missing.join(", ")
        )));
    }
    Ok(())
}

fn substitute_recursive(value: &mut Value, missing: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            *s = substitute_in_string(s, missing);
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_recursive(v, missing);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                substitute_recursive(v, missing);
            }
        }
        _ => {}
    }
}

fn substitute_in_string(input: &str, missing: &mut Vec<String>) -> String {
    ENV_VAR_REGEX
        .replace_all(input, |cap: &regex::Captures<'_>| {
            let var_name = &cap[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        missing.push(var_name.to_string());
                        String::new()
                    }
                },
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_env_vars() {
        env::set_var("RELAY_TEST_VAR", "test_value");

        let mut value = json!({
            "path": "${RELAY_TEST_VAR}/some/path",
            "default": "${RELAY_NON_EXISTENT:-default_value}",
            "nested": {
                "value": "${RELAY_TEST_VAR}"
            },
            "list": ["${RELAY_TEST_VAR}", 3]
        });

        substitute_env_vars(&mut value).unwrap();

        assert_eq!(value["path"], "test_value/some/path");
        assert_eq!(value["default"], "default_value");
        assert_eq!(value["nested"]["value"], "test_value");
        assert_eq!(value["list"][0], "test_value");
        assert_eq!(value["list"][1], 3);

        env::remove_var("RELAY_TEST_VAR");
    }

    #[test]
    fn test_missing_variable_is_reported() {
        let mut value = json!({ "url": "${RELAY_SURELY_UNSET_VAR}" });
        let err = substitute_env_vars(&mut value).unwrap_err();
        assert!(err.to_string().contains("RELAY_SURELY_UNSET_VAR"));
    }
}
