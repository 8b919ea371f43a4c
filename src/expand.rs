//! Recipe-template expansion.
//!
//! The build core never evaluates user code; it hands templates plus a
//! variable scope to an [`Expander`]. A scripting host can implement
//! the trait to evaluate `$(expr)` forms in its own language. The
//! bundled [`VarExpander`] resolves plain variable references, which is
//! all the rule language itself needs.

use std::collections::HashMap;

use crate::error::{KnitError, Result};

/// Resolves `$var` and `$(expr)` references inside one template string.
pub trait Expander {
    fn expand(&self, template: &str, scope: &VarScope) -> Result<String>;
}

/// A stack of variable tables searched front to back: node variables
/// (`input`, `output`, `match`, `dep`), then rule-set variables, then
/// CLI assignments, then the environment table.
#[derive(Debug, Default)]
pub struct VarScope<'a> {
    layers: Vec<&'a HashMap<String, String>>,
}

impl<'a> VarScope<'a> {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Add a layer below the existing ones.
    pub fn push(&mut self, layer: &'a HashMap<String, String>) -> &mut Self {
        self.layers.push(layer);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.layers
            .iter()
            .find_map(|layer| layer.get(name).map(String::as_str))
    }
}

/// Plain variable substitution: `$name`, `$(name)`, and `$$` for a
/// literal dollar. Unknown variables expand to the empty string, so a
/// recipe can reference optional settings without guards. A `$` that
/// does not start a reference (e.g. shell's `$@`) is left alone.
#[derive(Debug, Default)]
pub struct VarExpander;

impl Expander for VarExpander {
    fn expand(&self, template: &str, scope: &VarScope) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];

            if let Some(stripped) = rest.strip_prefix('$') {
                out.push('$');
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('(') {
                let close = stripped.find(')').ok_or_else(|| {
                    KnitError::Expand(format!("unclosed '$(' in '{}'", template))
                })?;
                let expr = stripped[..close].trim();
                if !is_identifier(expr) {
                    return Err(KnitError::Expand(format!(
                        "'$({})' needs a scripting host; only plain variables are supported here",
                        expr
                    )));
                }
                out.push_str(scope.get(expr).unwrap_or_default());
                rest = &stripped[close + 1..];
            } else {
                let len = ident_len(rest);
                if len == 0 {
                    out.push('$');
                } else {
                    out.push_str(scope.get(&rest[..len]).unwrap_or_default());
                    rest = &rest[len..];
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn ident_len(s: &str) -> usize {
    let mut len = 0;
    for (i, c) in s.char_indices() {
        let ok = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };
        if !ok {
            break;
        }
        len = i + c.len_utf8();
    }
    len
}

fn is_identifier(s: &str) -> bool {
    // Dotted names (env.HOME) are valid inside `$(...)` only.
    !s.is_empty()
        && s.split('.').all(|part| {
            !part.is_empty() && ident_len(part) == part.len()
        })
}
