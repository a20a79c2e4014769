// src/vars.rs

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::constants::MAX_SUBSTITUTION_DEPTH;
use crate::error::{Error, Result};

lazy_static! {
    static ref OUTER_VAR_REGEX: Regex = Regex::new(r"\$\{(.*?)\}").expect("invalid regex");
    static ref VAR_EXPR_REGEX: Regex =
        Regex::new(r"^(?:([^:|]+):\s*)?([^|\s]*)(?:\s*\|\s*(.*))?$").expect("invalid regex");
}

/// A read-only provider of variable values for one namespace.
pub trait VarNamespace {
    fn get_var(&self, key: &str) -> Option<String>;
}

/// The `env:` namespace backed by the process environment.
#[derive(Debug, Default)]
pub struct EnvVarNamespace;

impl VarNamespace for EnvVarNamespace {
    fn get_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Debug, Default)]
struct ScopeInner {
    vars: RefCell<BTreeMap<String, String>>,
    parent: Option<VarScope>,
}

/// A hierarchical name/value scope.
///
/// Lookups fall through to the parent scope on miss. Scopes are cheap handles
/// sharing their storage, so they can be held both by a target and by the
/// contexts built for substitution.
#[derive(Debug, Clone, Default)]
pub struct VarScope {
    inner: Rc<ScopeInner>,
}

impl VarScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: &Self) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                vars: RefCell::new(BTreeMap::new()),
                parent: Some(parent.clone()),
            }),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .vars
            .borrow_mut()
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.inner.vars.borrow_mut().remove(key);
    }

    /// Local map first, then the parent chain.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.inner.vars.borrow().get(key) {
            return Some(value.clone());
        }
        self.inner.parent.as_ref().and_then(|p| p.get(key))
    }

    pub fn get_no_recurse(&self, key: &str) -> Option<String> {
        self.inner.vars.borrow().get(key).cloned()
    }
}

impl VarNamespace for VarScope {
    fn get_var(&self, key: &str) -> Option<String> {
        self.get(key)
    }
}

/// A mapping from namespace name to value provider, assembled at each
/// substitution site.
#[derive(Default)]
pub struct VarContext<'a> {
    namespaces: BTreeMap<String, &'a dyn VarNamespace>,
}

impl<'a> VarContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, ns: &'a dyn VarNamespace) {
        self.namespaces.insert(name.into(), ns);
    }

    /// Replaces every `${[ns:]name[ | fallback]}` occurrence in `input`.
    ///
    /// Replacement strings are substituted recursively, so values may refer to
    /// further variables. A missing variable without fallback is an error.
    pub fn substitute(&self, input: &str, default_ns: &str) -> Result<String> {
        self.substitute_depth(input, default_ns, 0)
    }

    fn substitute_depth(&self, input: &str, default_ns: &str, depth: u32) -> Result<String> {
        if depth >= MAX_SUBSTITUTION_DEPTH {
            return Err(Error::var_substitution(format!(
                "maximum substitution depth ({MAX_SUBSTITUTION_DEPTH}) exceeded\n    in string '{input}'"
            )));
        }

        let mut result = String::with_capacity(input.len());
        let mut last_end = 0;

        for m in OUTER_VAR_REGEX.captures_iter(input) {
            let whole = m.get(0).ok_or_else(|| {
                Error::var_substitution("internal regex failure in substitution".to_string())
            })?;
            let expr = m.get(1).map(|g| g.as_str()).unwrap_or_default();

            result.push_str(&input[last_end..whole.start()]);
            result.push_str(&self.resolve_var_expr(input, expr, default_ns, depth)?);
            last_end = whole.end();
        }

        result.push_str(&input[last_end..]);
        Ok(result)
    }

    fn resolve_var_expr(
        &self,
        original: &str,
        expr: &str,
        default_ns: &str,
        depth: u32,
    ) -> Result<String> {
        let caps = VAR_EXPR_REGEX.captures(expr).ok_or_else(|| {
            Error::var_substitution(format!(
                "invalid variable definition\n    in string '{original}'"
            ))
        })?;

        let ns = caps
            .get(1)
            .map(|g| g.as_str())
            .unwrap_or(default_ns)
            .to_string();
        let key = caps.get(2).map(|g| g.as_str()).unwrap_or_default();
        let fallback = caps.get(3).map(|g| g.as_str()).unwrap_or_default();

        if key.is_empty() {
            return Err(Error::var_substitution(format!(
                "variable name not specified\n    in string '{original}'"
            )));
        }

        let provider = self.namespaces.get(&ns).ok_or_else(|| {
            let known = self
                .namespaces
                .keys()
                .map(|k| format!("\n    {k}"))
                .collect::<String>();
            Error::var_substitution(format!(
                "var namespace '{ns}' not found\n    in string '{original}'\n\n    Available namespaces:{known}"
            ))
        })?;

        if let Some(value) = provider.get_var(key) {
            return self.substitute_depth(&value, default_ns, depth + 1);
        }

        if !fallback.is_empty() {
            if let Some(redirect) = fallback.strip_prefix('$') {
                return self.resolve_var_expr(original, redirect, default_ns, depth);
            }
            return Ok(fallback.to_string());
        }

        Err(Error::var_substitution(format!(
            "variable '{ns}:{key}' not defined\n    in string '{original}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with(pairs: &[(&str, &str)]) -> VarScope {
        let scope = VarScope::new();
        for (k, v) in pairs {
            scope.set(*k, *v);
        }
        scope
    }

    #[test]
    fn substitutes_local_and_qualified_names() {
        let build = scope_with(&[("arch", "x64"), ("platform", "linux")]);
        let target = scope_with(&[("module", "app.hello")]);

        let mut ctx = VarContext::new();
        ctx.add("build", &build);
        ctx.add("target", &target);

        let out = ctx
            .substitute("${arch}-${platform} for ${target:module}", "build")
            .unwrap();
        assert_eq!(out, "x64-linux for app.hello");
    }

    #[test]
    fn falls_through_to_parent_scope() {
        let parent = scope_with(&[("configuration", "debug")]);
        let child = VarScope::with_parent(&parent);
        child.set("arch", "arm64");

        assert_eq!(child.get("arch").as_deref(), Some("arm64"));
        assert_eq!(child.get("configuration").as_deref(), Some("debug"));
        assert_eq!(child.get_no_recurse("configuration"), None);
    }

    #[test]
    fn fallback_literal_and_redirect() {
        let build = scope_with(&[("platform", "windows")]);

        let mut ctx = VarContext::new();
        ctx.add("build", &build);
        ctx.add("env", &EnvVarNamespace);

        assert_eq!(
            ctx.substitute("${env:RE_DOES_NOT_EXIST | fallback-value}", "build")
                .unwrap(),
            "fallback-value"
        );
        assert_eq!(
            ctx.substitute("${env:RE_DOES_NOT_EXIST | $build:platform}", "build")
                .unwrap(),
            "windows"
        );
    }

    #[test]
    fn missing_variable_without_fallback_fails() {
        let build = VarScope::new();
        let mut ctx = VarContext::new();
        ctx.add("build", &build);

        let err = ctx.substitute("${build:nope}", "build").unwrap_err();
        assert!(matches!(err, Error::VarSubstitution { .. }));
    }

    #[test]
    fn unknown_namespace_lists_available_ones() {
        let build = VarScope::new();
        let mut ctx = VarContext::new();
        ctx.add("build", &build);

        let err = ctx.substitute("${nope:key}", "build").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("var namespace 'nope' not found"));
        assert!(text.contains("build"));
    }

    #[test]
    fn replacement_values_are_expanded_recursively() {
        let build = scope_with(&[
            ("triplet", "${arch}-${platform}-${configuration}"),
            ("arch", "x64"),
            ("platform", "linux"),
            ("configuration", "release"),
        ]);
        let mut ctx = VarContext::new();
        ctx.add("build", &build);

        assert_eq!(
            ctx.substitute("out/${triplet}", "build").unwrap(),
            "out/x64-linux-release"
        );
    }

    #[test]
    fn cyclic_expansion_is_bounded() {
        let build = scope_with(&[("a", "${b}"), ("b", "${a}")]);
        let mut ctx = VarContext::new();
        ctx.add("build", &build);

        let err = ctx.substitute("${a}", "build").unwrap_err();
        assert!(err.to_string().contains("maximum substitution depth"));
    }

    #[test]
    fn substitution_is_idempotent_on_plain_strings() {
        let build = scope_with(&[("arch", "x64")]);
        let mut ctx = VarContext::new();
        ctx.add("build", &build);

        let once = ctx.substitute("prefix ${arch} suffix", "build").unwrap();
        let twice = ctx.substitute(&once, "build").unwrap();
        assert_eq!(once, twice);
    }
}
