// Path Templates
// Root directory plus a pattern with {placeholder} fields and glob metacharacters

use super::ResolutionError;
use crate::execution::ExecutionContext;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholder that renders to the context key (e.g. `_subject_id_sub001`)
pub const CONTEXT_KEY_PLACEHOLDER: &str = "context_key";

/// A file location pattern anchored at a root directory
///
/// The pattern may contain `{axis}` placeholders, which are substituted from
/// the execution context, and glob metacharacters (`*`, `?`, `[...]`), which
/// are matched against the filesystem by the resolver. `{{` and `}}` produce
/// literal braces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTemplate {
    root: PathBuf,
    pattern: String,
    #[serde(default = "default_strict")]
    strict: bool,
}

fn default_strict() -> bool {
    true
}

impl PathTemplate {
    /// Create a strict template (zero matches is an error)
    pub fn new(root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            pattern: pattern.into(),
            strict: true,
        }
    }

    /// Allow zero matches
    pub fn non_strict(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Names of the placeholders in the pattern, in order of appearance
    pub fn placeholders(&self) -> Result<Vec<String>, ResolutionError> {
        let mut names = Vec::new();
        substitute(&self.pattern, |name| {
            names.push(name.to_string());
            Some(String::new())
        })
        .map_err(|e| self.placeholder_error(e, None))?;
        Ok(names)
    }

    /// Substitute placeholders from the context, without touching the filesystem
    pub fn render(&self, context: &ExecutionContext) -> Result<String, ResolutionError> {
        substitute(&self.pattern, |name| {
            if name == CONTEXT_KEY_PLACEHOLDER {
                Some(context.key())
            } else {
                context.get(name).map(str::to_string)
            }
        })
        .map_err(|e| self.placeholder_error(e, Some(context)))
    }

    /// Rendered pattern joined onto the root
    pub fn render_path(&self, context: &ExecutionContext) -> Result<PathBuf, ResolutionError> {
        Ok(self.root.join(self.render(context)?))
    }

    fn placeholder_error(
        &self,
        err: PlaceholderError,
        context: Option<&ExecutionContext>,
    ) -> ResolutionError {
        match err {
            PlaceholderError::Missing(placeholder) => ResolutionError::MissingPlaceholder {
                placeholder,
                template: self.pattern.clone(),
                context: context.map(|c| c.to_string()).unwrap_or_default(),
            },
            PlaceholderError::Unterminated { .. } | PlaceholderError::Empty { .. } => {
                ResolutionError::InvalidTemplate {
                    template: self.pattern.clone(),
                    message: err.to_string(),
                }
            }
        }
    }
}

/// Whether a rendered pattern needs filesystem matching
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Placeholder substitution failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
    #[error("no value for placeholder '{0}'")]
    Missing(String),

    #[error("unterminated '{{' at offset {offset}")]
    Unterminated { offset: usize },

    #[error("empty placeholder at offset {offset}")]
    Empty { offset: usize },
}

/// Replace every `{name}` in `template` with `lookup(name)`
///
/// `{{` and `}}` are literal braces. The first placeholder without a value
/// aborts substitution.
pub fn substitute<F>(template: &str, mut lookup: F) -> Result<String, PlaceholderError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut result = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                result.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                result.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(PlaceholderError::Unterminated { offset });
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(PlaceholderError::Empty { offset });
                }
                match lookup(name) {
                    Some(value) => result.push_str(&value),
                    None => return Err(PlaceholderError::Missing(name.to_string())),
                }
            }
            c => result.push(c),
        }
    }

    Ok(result)
}
