//! Configuration binding.
//!
//! Raw YAML is read from disk (or injected as an already-populated value),
//! environment placeholders are substituted, and each registered section is
//! bound through its descriptor table: empty fields receive their declared
//! defaults, required fields without a value produce an error naming the
//! full `parent.field` path, and choice-restricted fields are validated.
//! The patched node is then decoded with serde.
//!
//! A field counts as empty when it is absent, null, an empty string, a zero
//! number, `false`, or an empty sequence. One refinement over the original
//! zero-value rule: numbers and booleans written explicitly in the input
//! are honoured as-is (so `port: 0` requests an OS-assigned port instead
//! of the default); implicit zeros still receive their defaults.

pub mod duration;
pub mod schema;

use std::path::Path;

use serde_yaml::{Mapping, Value};

pub use duration::{format_duration, parse_duration};
pub use schema::{Bindable, Entry, FieldKind, FieldSpec};

/// Hard cap on substitution passes so a self-referential environment value
/// cannot spin forever.
const MAX_SUBSTITUTION_PASSES: usize = 100;

/// Errors produced while reading and binding configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config section {0} is not a mapping")]
    NotMapping(String),
    #[error("required config parameter not set: {0}")]
    RequiredMissing(String),
    #[error("invalid value {value:?} for {path} (choices: {choices:?})")]
    InvalidChoice {
        path: String,
        value: String,
        choices: &'static [&'static str],
    },
    #[error("bad default literal for {0}")]
    BadDefault(String),
    #[error("decode {section} config: {source}")]
    Decode {
        section: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("encode {section} config: {source}")]
    Encode {
        section: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config is empty or not a YAML mapping")]
    EmptyDocument,
    #[error("unsupported config file type: {0:?}")]
    UnsupportedFormat(String),
    #[error("read config file: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Environment substitution
// ---------------------------------------------------------------------------

/// Replace every `{{ident}}` token with the value of the environment
/// variable `IDENT` (upper-cased). Substitution repeats until no token
/// remains, so values that expand to further tokens are resolved too.
/// Missing variables substitute as empty strings.
#[must_use]
pub fn substitute_env(raw: &str) -> String {
    let mut buf = raw.to_string();
    for _ in 0..MAX_SUBSTITUTION_PASSES {
        let Some((token, ident)) = find_placeholder(&buf) else {
            return buf;
        };
        let value = std::env::var(ident.to_uppercase()).unwrap_or_default();
        buf = buf.replace(&token, &value);
    }
    buf
}

/// Locate the first well-formed `{{ident}}` token, returning the full token
/// and the identifier inside it.
fn find_placeholder(buf: &str) -> Option<(String, String)> {
    let mut search_from = 0;
    while let Some(open) = buf[search_from..].find("{{") {
        let start = search_from + open;
        let after = &buf[start + 2..];
        let ident_len = after
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(after.len());
        if ident_len > 0 && after[ident_len..].starts_with("}}") {
            let ident = &after[..ident_len];
            return Some((format!("{{{{{ident}}}}}"), ident.to_string()));
        }
        search_from = start + 2;
    }
    None
}

// ---------------------------------------------------------------------------
// Root document handling
// ---------------------------------------------------------------------------

/// Parse raw YAML into the top-level mapping after environment substitution.
pub fn parse_root(raw: &str) -> Result<Mapping, ConfigError> {
    let substituted = substitute_env(raw);
    let value: Value =
        serde_yaml::from_str(&substituted).map_err(|source| ConfigError::Decode {
            section: "root".to_string(),
            source,
        })?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        _ => Err(ConfigError::EmptyDocument),
    }
}

/// Read the configuration file at `path`. Only YAML is supported.
pub fn load_file(path: &Path) -> Result<Mapping, ConfigError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    if ext != "yaml" && ext != "yml" {
        return Err(ConfigError::UnsupportedFormat(ext.to_string()));
    }
    let raw = std::fs::read_to_string(path)?;
    parse_root(&raw)
}

/// Look up a top-level section by its registration key.
#[must_use]
pub fn section<'a>(root: &'a Mapping, key: &str) -> Option<&'a Value> {
    root.get(&Value::String(key.to_string()))
}

// ---------------------------------------------------------------------------
// Section binding
// ---------------------------------------------------------------------------

/// Bind one section: start from the caller-supplied `base` values, overlay
/// the raw YAML node, patch defaults and verify required/choice constraints
/// via the descriptor table, then decode into the typed section.
pub fn bind_section<T: Bindable>(
    section_name: &str,
    base: &T,
    node: Option<&Value>,
) -> Result<T, ConfigError> {
    let merged = bind_section_value(section_name, base, node)?;
    serde_yaml::from_value(merged).map_err(|source| ConfigError::Decode {
        section: section_name.to_string(),
        source,
    })
}

/// Same as [`bind_section`] but stops at the merged YAML value. Used by
/// `--print-config` to dump the fully resolved configuration.
pub fn bind_section_value<T: Bindable>(
    section_name: &str,
    base: &T,
    node: Option<&Value>,
) -> Result<Value, ConfigError> {
    let mut merged = serde_yaml::to_value(base).map_err(|source| ConfigError::Encode {
        section: section_name.to_string(),
        source,
    })?;
    if merged.is_null() {
        merged = Value::Mapping(Mapping::new());
    }
    if let Some(node) = node {
        overlay(&mut merged, node);
    }
    apply_schema(&mut merged, node, T::schema(), section_name)?;
    Ok(merged)
}

/// Recursively overlay `src` onto `dst`: mapping keys merge, anything else
/// replaces. Null source values leave the destination untouched.
fn overlay(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (_, Value::Null) => {}
        (Value::Mapping(dst_map), Value::Mapping(src_map)) => {
            for (key, src_val) in src_map {
                match dst_map.get_mut(key) {
                    Some(dst_val) => overlay(dst_val, src_val),
                    None => {
                        dst_map.insert(key.clone(), src_val.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

fn apply_schema(
    node: &mut Value,
    input: Option<&Value>,
    entries: &[Entry],
    path: &str,
) -> Result<(), ConfigError> {
    let Value::Mapping(map) = node else {
        return Err(ConfigError::NotMapping(path.to_string()));
    };
    if matches!(input, Some(value) if !value.is_null() && value.as_mapping().is_none()) {
        return Err(ConfigError::NotMapping(path.to_string()));
    }
    let input = input.and_then(Value::as_mapping);

    for entry in entries {
        match entry {
            Entry::Field(field) => apply_field(map, input, field, path)?,
            Entry::Section { key, entries } => {
                let key_val = Value::String((*key).to_string());
                let sub_input = input.and_then(|m| m.get(&key_val));
                let sub = map
                    .entry(key_val)
                    .or_insert_with(|| Value::Mapping(Mapping::new()));
                if sub.is_null() {
                    *sub = Value::Mapping(Mapping::new());
                }
                apply_schema(sub, sub_input, entries, &join_path(path, key))?;
            }
        }
    }
    Ok(())
}

fn apply_field(
    map: &mut Mapping,
    input: Option<&Mapping>,
    field: &FieldSpec,
    path: &str,
) -> Result<(), ConfigError> {
    let key_val = Value::String(field.key.to_string());
    let field_path = join_path(path, field.key);
    let current = map.get(&key_val);

    // Numbers and booleans spelled out in the input stay as written, even
    // when zero-valued.
    let written_scalar = matches!(
        input.and_then(|m| m.get(&key_val)),
        Some(Value::Number(_) | Value::Bool(_))
    );

    if is_empty(current, field.kind) {
        if let Some(literal) = field.default {
            if !written_scalar {
                let value = parse_default(literal, field.kind)
                    .ok_or_else(|| ConfigError::BadDefault(field_path.clone()))?;
                map.insert(key_val, value);
            }
        } else if field.required {
            return Err(ConfigError::RequiredMissing(field_path));
        }
        return Ok(());
    }

    if !field.choices.is_empty() {
        let value = current.and_then(Value::as_str).unwrap_or_default();
        if !field.choices.contains(&value) {
            return Err(ConfigError::InvalidChoice {
                path: field_path,
                value: value.to_string(),
                choices: field.choices,
            });
        }
    }
    Ok(())
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Zero-value semantics carried over from the original binder: absent,
/// null, `""`, numeric zero, `false`, and empty sequences are all empty.
fn is_empty(value: Option<&Value>, kind: FieldKind) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => {
            if s.is_empty() {
                return true;
            }
            kind == FieldKind::Duration
                && parse_duration(s).map(|d| d.is_zero()).unwrap_or(false)
        }
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) == 0.0,
        Some(Value::Bool(b)) => !b,
        Some(Value::Sequence(seq)) => seq.is_empty(),
        Some(Value::Mapping(map)) => map.is_empty(),
        Some(Value::Tagged(_)) => false,
    }
}

fn parse_default(literal: &str, kind: FieldKind) -> Option<Value> {
    match kind {
        FieldKind::Str => Some(Value::String(literal.to_string())),
        FieldKind::Int => literal.parse::<i64>().ok().map(Value::from),
        FieldKind::UInt => literal.parse::<u64>().ok().map(Value::from),
        FieldKind::Float => literal.parse::<f64>().ok().map(Value::from),
        FieldKind::Bool => literal.parse::<bool>().ok().map(Value::Bool),
        FieldKind::Duration => parse_duration(literal)
            .ok()
            .map(|_| Value::String(literal.to_string())),
        FieldKind::List => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Inner {
        namespace: String,
        buckets: Vec<f64>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Outer {
        port: u16,
        #[serde(with = "duration")]
        timeout: Duration,
        level: String,
        verbose: bool,
        inner: Inner,
    }

    impl Bindable for Outer {
        fn schema() -> &'static [Entry] {
            const INNER: &[Entry] = &[
                Entry::Field(FieldSpec::new("namespace", FieldKind::Str).required()),
                Entry::Field(FieldSpec::new("buckets", FieldKind::List)),
            ];
            const ENTRIES: &[Entry] = &[
                Entry::Field(FieldSpec::new("port", FieldKind::UInt).with_default("8080")),
                Entry::Field(
                    FieldSpec::new("timeout", FieldKind::Duration).with_default("5m"),
                ),
                Entry::Field(
                    FieldSpec::new("level", FieldKind::Str)
                        .with_default("info")
                        .with_choices(&["debug", "info", "warn", "error"]),
                ),
                Entry::Field(FieldSpec::new("verbose", FieldKind::Bool)),
                Entry::Section {
                    key: "inner",
                    entries: INNER,
                },
            ];
            ENTRIES
        }
    }

    fn yaml(raw: &str) -> Value {
        serde_yaml::from_str(raw).unwrap()
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let node = yaml("inner:\n  namespace: svc\n");
        let outer: Outer = bind_section("app", &Outer::default(), Some(&node)).unwrap();
        assert_eq!(outer.port, 8080);
        assert_eq!(outer.timeout, Duration::from_secs(300));
        assert_eq!(outer.level, "info");
        assert_eq!(outer.inner.namespace, "svc");
    }

    #[test]
    fn explicit_values_win_over_defaults() {
        let node = yaml("port: 9999\ntimeout: 2s\ninner:\n  namespace: svc\n");
        let outer: Outer = bind_section("app", &Outer::default(), Some(&node)).unwrap();
        assert_eq!(outer.port, 9999);
        assert_eq!(outer.timeout, Duration::from_secs(2));
    }

    #[test]
    fn implicit_zero_receives_default() {
        // The caller's zeroed base counts as empty, so the declared
        // default fills in.
        let node = yaml("inner:\n  namespace: svc\n");
        let outer: Outer = bind_section("app", &Outer::default(), Some(&node)).unwrap();
        assert_eq!(outer.port, 8080);
    }

    #[test]
    fn explicit_zero_is_honoured() {
        // A zero written in the input stays zero (e.g. port 0 requests an
        // OS-assigned port).
        let node = yaml("port: 0\ninner:\n  namespace: svc\n");
        let outer: Outer = bind_section("app", &Outer::default(), Some(&node)).unwrap();
        assert_eq!(outer.port, 0);
    }

    #[test]
    fn explicit_empty_string_still_receives_default() {
        let node = yaml("level: ''\ninner:\n  namespace: svc\n");
        let outer: Outer = bind_section("app", &Outer::default(), Some(&node)).unwrap();
        assert_eq!(outer.level, "info");
    }

    #[test]
    fn required_error_names_flattened_path() {
        let err = bind_section::<Outer>("app", &Outer::default(), None).unwrap_err();
        match err {
            ConfigError::RequiredMissing(path) => assert_eq!(path, "app.inner.namespace"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_choice_is_rejected() {
        let node = yaml("level: loud\ninner:\n  namespace: svc\n");
        let err = bind_section::<Outer>("app", &Outer::default(), Some(&node)).unwrap_err();
        match err {
            ConfigError::InvalidChoice { path, value, .. } => {
                assert_eq!(path, "app.level");
                assert_eq!(value, "loud");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn caller_base_values_survive_binding() {
        let base = Outer {
            verbose: true,
            ..Outer::default()
        };
        let node = yaml("inner:\n  namespace: svc\n");
        let outer: Outer = bind_section("app", &base, Some(&node)).unwrap();
        assert!(outer.verbose);
    }

    #[test]
    fn default_merge_round_trips() {
        // Binding with no input and serialising back must equal the fully
        // defaulted record.
        let node = yaml("inner:\n  namespace: svc\n");
        let bound = bind_section_value("app", &Outer::default(), Some(&node)).unwrap();
        let typed: Outer = serde_yaml::from_value(bound.clone()).unwrap();
        let again = bind_section_value("app", &typed, Some(&node)).unwrap();
        assert_eq!(bound, again);
    }

    #[test]
    fn non_mapping_section_is_rejected() {
        let node = yaml("'just a string'");
        let err = bind_section::<Outer>("app", &Outer::default(), Some(&node)).unwrap_err();
        assert!(matches!(err, ConfigError::NotMapping(path) if path == "app"));
    }

    #[test]
    fn substitute_env_replaces_and_uppercases() {
        std::env::set_var("CHASSIS_TEST_PORT", "4711");
        let out = substitute_env("port: {{chassis_test_port}}");
        assert_eq!(out, "port: 4711");
    }

    #[test]
    fn substitute_env_missing_var_becomes_empty() {
        std::env::remove_var("CHASSIS_TEST_NO_SUCH_VAR");
        let out = substitute_env("token: '{{chassis_test_no_such_var}}'");
        assert_eq!(out, "token: ''");
    }

    #[test]
    fn substitute_env_is_idempotent() {
        std::env::set_var("CHASSIS_TEST_HOST", "db.internal");
        let once = substitute_env("host: {{chassis_test_host}}");
        let twice = substitute_env(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn substitute_env_resolves_nested_tokens() {
        std::env::set_var("CHASSIS_TEST_OUTER", "{{CHASSIS_TEST_INNER}}");
        std::env::set_var("CHASSIS_TEST_INNER", "resolved");
        let out = substitute_env("value: {{chassis_test_outer}}");
        assert_eq!(out, "value: resolved");
    }

    #[test]
    fn substitute_env_leaves_malformed_tokens() {
        let raw = "a: '{{not closed' \nb: '{}'";
        assert_eq!(substitute_env(raw), raw);
    }

    #[test]
    fn parse_root_rejects_empty_document() {
        assert!(matches!(parse_root(""), Err(ConfigError::EmptyDocument)));
        assert!(matches!(
            parse_root("- just\n- a list\n"),
            Err(ConfigError::EmptyDocument)
        ));
    }

    #[test]
    fn load_file_rejects_unknown_extension() {
        let err = load_file(Path::new("/tmp/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(ext) if ext == "toml"));
    }

    #[test]
    fn load_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "app:\n  port: 8080\n").unwrap();
        let root = load_file(&path).unwrap();
        assert!(section(&root, "app").is_some());
        assert!(section(&root, "missing").is_none());
    }
}
