// src/config.rs

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// A raw or resolved target configuration tree.
pub type TargetConfig = Value;

/// The category → current-value mappings a configuration is flattened against
/// (e.g. `arch` → `x64`, `platform` → `linux`).
pub type ConfigMappings = BTreeMap<String, String>;

const OVERRIDE_PREFIX: &str = "override.";

/// Fields that never inherit from ancestors; they are taken from the leaf
/// configuration only after the genealogy merge.
const LEAF_ONLY_KEYS: &[&str] = &["deps", "cond-deps", "actions", "tasks"];

/// Merges `source` into `target`.
///
/// Scalars replace, maps merge per key, sequences append. A map key carrying
/// the `override.` prefix replaces the target subtree verbatim instead of
/// merging into it.
pub fn merge_node(target: &mut Value, source: &Value, overridden: bool) {
    match source {
        Value::Mapping(map) => merge_map(target, map, overridden),
        Value::Sequence(seq) => merge_sequence(target, seq, overridden),
        other => *target = other.clone(),
    }
}

fn merge_map(target: &mut Value, source: &Mapping, overridden: bool) {
    if overridden {
        *target = Value::Mapping(source.clone());
        return;
    }

    if !target.is_mapping() {
        *target = Value::Mapping(Mapping::new());
    }

    for (key, value) in source {
        let (slot_key, key_overridden) = match key.as_str() {
            Some(s) if s.starts_with(OVERRIDE_PREFIX) => (
                Value::String(s[OVERRIDE_PREFIX.len()..].to_string()),
                true,
            ),
            _ => (key.clone(), false),
        };

        let map = match target.as_mapping_mut() {
            Some(m) => m,
            None => return,
        };
        let slot = map.entry(slot_key).or_insert(Value::Null);
        merge_node(slot, value, key_overridden);
    }
}

fn merge_sequence(target: &mut Value, source: &[Value], overridden: bool) {
    if overridden || !target.is_sequence() {
        *target = Value::Sequence(source.to_vec());
        return;
    }

    if let Some(seq) = target.as_sequence_mut() {
        seq.extend(source.iter().cloned());
    }
}

/// Returns a copy of `base` with `overlay` merged on top.
pub fn merge_nodes(base: &Value, overlay: &Value) -> Value {
    let mut cloned = base.clone();
    merge_node(&mut cloned, overlay, false);
    cloned
}

fn selector_matches(raw: &str, current: &str) -> bool {
    if raw == "any" {
        return true;
    }

    for term in raw.split('|') {
        if current == term || current.starts_with(&format!("{term}.")) {
            return true;
        }
        if let Some(negated) = term.strip_prefix('!') {
            if negated != current {
                return true;
            }
        }
    }

    false
}

/// Flattens every conditional `category.selector` key of `cfg` against the
/// given mappings, merging matched subtrees into their parent map.
///
/// Non-conditional nested maps are recursed into so that deeply nested
/// conditionals resolve too. A matched subtree holding the scalar
/// `unsupported` fails resolution for this configuration.
pub fn flatten_config(
    cfg: &Value,
    mappings: &ConfigMappings,
    module: Option<&str>,
) -> Result<Value> {
    let Some(map) = cfg.as_mapping() else {
        return Ok(cfg.clone());
    };

    let mut result = cfg.clone();

    for (key, value) in map {
        let Some(key_str) = key.as_str() else {
            continue;
        };

        let mut conditional = None;
        for (category, current) in mappings {
            if let Some(raw) = key_str.strip_prefix(&format!("{category}.")) {
                conditional = Some((category.as_str(), current.as_str(), raw));
                break;
            }
        }

        match conditional {
            Some((category, current, raw)) => {
                if selector_matches(raw, current) {
                    if value.as_str() == Some("unsupported") {
                        return Err(Error::config(
                            module.map(str::to_string),
                            format!("unsupported {category} '{current}'"),
                        ));
                    }

                    let flat = flatten_config(value, mappings, module)?;
                    merge_node(&mut result, &flat, false);
                }

                if let Some(m) = result.as_mapping_mut() {
                    m.remove(key);
                }
            }
            None => {
                if value.is_mapping() {
                    let flat = flatten_config(value, mappings, module)?;
                    if let Some(m) = result.as_mapping_mut() {
                        m.insert(key.clone(), flat);
                    }
                }
            }
        }
    }

    Ok(result)
}

/// Produces the fully resolved configuration of a target from its ancestor
/// chain (root first, leaf last).
///
/// Each config is flattened and fold-merged in order; `deps`, `cond-deps`,
/// `actions` and `tasks` are then restored from the flattened leaf alone, as
/// those fields do not inherit.
pub fn resolve_genealogy(
    configs_root_first: &[Value],
    mappings: &ConfigMappings,
    module: Option<&str>,
) -> Result<Value> {
    let leaf_flat = match configs_root_first.last() {
        Some(leaf) => flatten_config(leaf, mappings, module)?,
        None => return Ok(Value::Mapping(Mapping::new())),
    };

    let mut result = Value::Mapping(Mapping::new());

    for cfg in configs_root_first {
        let flat = flatten_config(cfg, mappings, module)?;
        merge_node(&mut result, &flat, false);
    }

    if let Some(map) = result.as_mapping_mut() {
        for key in LEAF_ONLY_KEYS {
            let key_value = Value::String((*key).to_string());
            match leaf_flat.get(*key) {
                Some(v) => {
                    map.insert(key_value, v.clone());
                }
                None => {
                    map.remove(&key_value);
                }
            }
        }
    }

    Ok(result)
}

/// Renders a scalar YAML value to its string form.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Fetches a string entry from a config map.
pub fn entry_str(cfg: &Value, key: &str) -> Option<String> {
    cfg.get(key).and_then(scalar_string)
}

/// Fetches a boolean entry from a config map.
pub fn entry_bool(cfg: &Value, key: &str) -> Option<bool> {
    match cfg.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s == "true"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn mappings(pairs: &[(&str, &str)]) -> ConfigMappings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn scalars_replace_and_sequences_append() {
        let mut target = yaml("{a: 1, list: [x]}");
        merge_node(&mut target, &yaml("{a: 2, list: [y], b: 3}"), false);

        assert_eq!(target, yaml("{a: 2, list: [x, y], b: 3}"));
    }

    #[test]
    fn override_prefix_replaces_subtree_verbatim() {
        let mut target = yaml("{cxx-compile-definitions: {FOO: 1, KEEP: 2}}");
        merge_node(
            &mut target,
            &yaml("{override.cxx-compile-definitions: {BAR: 1}}"),
            false,
        );

        assert_eq!(target, yaml("{cxx-compile-definitions: {BAR: 1}}"));
    }

    #[test]
    fn override_prefix_replaces_sequences_too() {
        let mut target = yaml("{flags: [a, b]}");
        merge_node(&mut target, &yaml("{override.flags: [c]}"), false);

        assert_eq!(target, yaml("{flags: [c]}"));
    }

    #[test]
    fn conditional_key_merges_on_match() {
        let cfg = yaml(
            "{type: executable, arch.x64: {cxx-compile-definitions: {IS_64: 1}}, arch.x86: {cxx-compile-definitions: {IS_32: 1}}}",
        );
        let flat = flatten_config(&cfg, &mappings(&[("arch", "x64")]), None).unwrap();

        assert_eq!(
            flat,
            yaml("{type: executable, cxx-compile-definitions: {IS_64: 1}}")
        );
    }

    #[test]
    fn unsupported_sentinel_fails_resolution() {
        let cfg = yaml("{arch.x86: unsupported}");
        let err = flatten_config(&cfg, &mappings(&[("arch", "x86")]), Some("app")).unwrap_err();

        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("unsupported arch 'x86'"));

        // The same config resolves fine for a non-matching arch.
        let flat = flatten_config(&cfg, &mappings(&[("arch", "x64")]), Some("app")).unwrap();
        assert_eq!(flat, yaml("{}"));
    }

    #[test]
    fn any_selector_always_merges() {
        let cfg = yaml("{platform.any: {vars: {seen: 'yes'}}}");
        let flat = flatten_config(&cfg, &mappings(&[("platform", "freebsd")]), None).unwrap();
        assert_eq!(flat, yaml("{vars: {seen: 'yes'}}"));
    }

    #[test]
    fn alternative_and_negated_selectors() {
        let maps = mappings(&[("platform", "linux")]);

        let alt = yaml("{platform.windows|linux: {ok: 1}}");
        assert_eq!(flatten_config(&alt, &maps, None).unwrap(), yaml("{ok: 1}"));

        let neg = yaml("{config.!debug: {optimized: 1}}");
        let flat = flatten_config(&neg, &mappings(&[("config", "release")]), None).unwrap();
        assert_eq!(flat, yaml("{optimized: 1}"));

        let neg_miss = flatten_config(&neg, &mappings(&[("config", "debug")]), None).unwrap();
        assert_eq!(neg_miss, yaml("{}"));
    }

    #[test]
    fn selector_matches_by_prefix() {
        let cfg = yaml("{platform.windows: {msvc: 1}}");
        let flat = flatten_config(&cfg, &mappings(&[("platform", "windows.msvc")]), None).unwrap();
        assert_eq!(flat, yaml("{msvc: 1}"));
    }

    #[test]
    fn nested_conditionals_resolve() {
        let cfg = yaml("{vars: {arch.x64: {width: '64'}}}");
        let flat = flatten_config(&cfg, &mappings(&[("arch", "x64")]), None).unwrap();
        assert_eq!(flat, yaml("{vars: {width: '64'}}"));
    }

    #[test]
    fn flattening_is_deterministic() {
        let cfg = yaml("{a: 1, arch.x64: {b: 2}, nested: {config.debug: {c: 3}}}");
        let maps = mappings(&[("arch", "x64"), ("config", "debug")]);

        let once = flatten_config(&cfg, &maps, None).unwrap();
        let twice = flatten_config(&cfg, &maps, None).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn genealogy_merges_root_first_and_keeps_leaf_deps() {
        let root = yaml("{cxx-standard: '17', deps: [rootdep], vars: {from-root: 1}}");
        let leaf = yaml("{cxx-standard: '20', deps: [leafdep]}");

        let resolved = resolve_genealogy(&[root, leaf], &mappings(&[]), None).unwrap();

        assert_eq!(entry_str(&resolved, "cxx-standard").as_deref(), Some("20"));
        assert_eq!(resolved.get("deps").unwrap(), &yaml("[leafdep]"));
        assert_eq!(resolved.get("vars").unwrap(), &yaml("{from-root: 1}"));
    }

    #[test]
    fn genealogy_drops_ancestor_deps_when_leaf_has_none() {
        let root = yaml("{deps: [rootdep], actions: [{copy: {from: a, to: b}}]}");
        let leaf = yaml("{name: child}");

        let resolved = resolve_genealogy(&[root, leaf], &mappings(&[]), None).unwrap();

        assert!(resolved.get("deps").is_none());
        assert!(resolved.get("actions").is_none());
    }

    #[test]
    fn genealogy_respects_override_between_layers() {
        let root = yaml("{cxx-compile-definitions: {FOO: 1}}");
        let leaf = yaml("{override.cxx-compile-definitions: {BAR: 1}}");

        let resolved = resolve_genealogy(&[root, leaf], &mappings(&[]), None).unwrap();
        assert_eq!(
            resolved.get("cxx-compile-definitions").unwrap(),
            &yaml("{BAR: 1}")
        );
    }
}
