use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tether_models::{ParameterKind, ParameterSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    MissingParameter,
    TypeMismatch,
    PatternMismatch,
    DisallowedValue,
}

/// Field-level validation failure, returned to the emitter verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub parameter: String,
    pub code: ValidationCode,
    pub message: String,
}

impl FieldError {
    fn new(spec: &ParameterSpec, code: ValidationCode, message: String) -> Self {
        Self {
            parameter: spec.name.clone(),
            code,
            message,
        }
    }

    fn mismatch(spec: &ParameterSpec, value: &Value) -> Self {
        let got = match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        };
        Self::new(
            spec,
            ValidationCode::TypeMismatch,
            format!("expected {}, got {got}", spec.kind.as_str()),
        )
    }
}

fn script_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script>").unwrap())
}

fn script_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</?script[^>]*>").unwrap())
}

fn js_uri_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)javascript\s*:").unwrap())
}

fn event_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\bon\w+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).unwrap())
}

/// Truncate, strip script payloads and trim. Truncation happens first so a
/// pattern never matches text the caller would not store.
pub fn sanitize_string(input: &str, max_length: Option<usize>) -> String {
    let mut value: String = match max_length {
        Some(max) => input.chars().take(max).collect(),
        None => input.to_string(),
    };
    value = script_block_re().replace_all(&value, "").into_owned();
    value = script_tag_re().replace_all(&value, "").into_owned();
    value = js_uri_re().replace_all(&value, "").into_owned();
    value = event_attr_re().replace_all(&value, "").into_owned();
    value.trim().to_string()
}

const MAX_OBJECT_KEY_LEN: usize = 50;

/// Validate an untrusted payload against the declared parameters. The
/// output carries only declared, validated fields — an allow-list. All
/// field errors are collected so the emitter sees every problem at once.
pub fn validate_payload(
    specs: &[ParameterSpec],
    payload: &Value,
) -> Result<Map<String, Value>, Vec<FieldError>> {
    let source = payload.as_object();
    let mut out = Map::new();
    let mut errors = Vec::new();

    for spec in specs {
        match source.and_then(|m| m.get(&spec.name)) {
            None | Some(Value::Null) => {
                if spec.required {
                    errors.push(FieldError::new(
                        spec,
                        ValidationCode::MissingParameter,
                        format!("required parameter '{}' is missing", spec.name),
                    ));
                }
            }
            Some(value) => match check_parameter(spec, value) {
                Ok(clean) => {
                    out.insert(spec.name.clone(), clean);
                }
                Err(err) => errors.push(err),
            },
        }
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

fn check_parameter(spec: &ParameterSpec, value: &Value) -> Result<Value, FieldError> {
    match spec.kind {
        ParameterKind::String => {
            let Some(raw) = value.as_str() else {
                return Err(FieldError::mismatch(spec, value));
            };
            let cleaned = if spec.sanitize {
                sanitize_string(raw, spec.max_length)
            } else {
                raw.to_string()
            };
            if let Some(pattern) = &spec.pattern {
                match Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(&cleaned) {
                            return Err(FieldError::new(
                                spec,
                                ValidationCode::PatternMismatch,
                                format!("value does not match pattern '{pattern}'"),
                            ));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            parameter = %spec.name,
                            error = %e,
                            "unparseable parameter pattern, skipping check"
                        );
                    }
                }
            }
            check_allowed(spec, Value::String(cleaned))
        }
        ParameterKind::Number => {
            let coerced = match value {
                Value::Number(n) => Value::Number(n.clone()),
                Value::String(s) => {
                    if let Ok(i) = s.trim().parse::<i64>() {
                        Value::from(i)
                    } else if let Some(f) = s
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                    {
                        Value::Number(f)
                    } else {
                        return Err(FieldError::mismatch(spec, value));
                    }
                }
                _ => return Err(FieldError::mismatch(spec, value)),
            };
            check_allowed(spec, coerced)
        }
        ParameterKind::Boolean => {
            let coerced = match value {
                Value::Bool(b) => *b,
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => true,
                    "false" | "0" => false,
                    _ => return Err(FieldError::mismatch(spec, value)),
                },
                _ => return Err(FieldError::mismatch(spec, value)),
            };
            check_allowed(spec, Value::Bool(coerced))
        }
        ParameterKind::Object => {
            // `as_object` is None for arrays, which must not pass here.
            let Some(map) = value.as_object() else {
                return Err(FieldError::mismatch(spec, value));
            };
            if !spec.sanitize {
                return Ok(value.clone());
            }
            let mut clean = Map::new();
            for (key, entry) in map {
                if key.chars().count() > MAX_OBJECT_KEY_LEN {
                    continue;
                }
                let entry = match entry {
                    Value::String(s) => Value::String(sanitize_string(s, None)),
                    other => other.clone(),
                };
                clean.insert(key.clone(), entry);
            }
            Ok(Value::Object(clean))
        }
        ParameterKind::Array => {
            let Some(items) = value.as_array() else {
                return Err(FieldError::mismatch(spec, value));
            };
            if !spec.sanitize {
                return Ok(value.clone());
            }
            let limit = spec.max_length.unwrap_or(items.len());
            let clean: Vec<Value> = items
                .iter()
                .take(limit)
                .map(|item| match item {
                    Value::String(s) => Value::String(sanitize_string(s, None)),
                    other => other.clone(),
                })
                .collect();
            Ok(Value::Array(clean))
        }
    }
}

fn check_allowed(spec: &ParameterSpec, value: Value) -> Result<Value, FieldError> {
    if let Some(allowed) = &spec.allowed_values {
        if !allowed.contains(&value) {
            return Err(FieldError::new(
                spec,
                ValidationCode::DisallowedValue,
                format!("'{value}' is not an allowed value for '{}'", spec.name),
            ));
        }
    }
    Ok(value)
}
