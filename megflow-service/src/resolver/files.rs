// File Resolver
// Matches rendered path templates against the filesystem

use super::template::{is_glob, PathTemplate};
use super::ResolutionError;
use crate::execution::ExecutionContext;

use globset::GlobBuilder;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Resolves path templates to concrete, existing files
pub struct FileResolver;

impl FileResolver {
    /// Resolve a template for one execution context
    ///
    /// Glob matches are returned sorted lexicographically by path. With a
    /// strict template, zero matches is a `NoMatch` error; otherwise an empty
    /// list is returned.
    pub fn resolve(
        template: &PathTemplate,
        context: &ExecutionContext,
    ) -> Result<Vec<PathBuf>, ResolutionError> {
        let root = template.root();
        if !root.is_dir() {
            return Err(ResolutionError::RootMissing(root.to_path_buf()));
        }

        let rendered = template.render(context)?;
        let matches = if is_glob(&rendered) {
            Self::glob(root, &rendered)?
        } else {
            let path = root.join(&rendered);
            if path.exists() {
                vec![path]
            } else {
                Vec::new()
            }
        };

        tracing::trace!(
            pattern = %root.join(&rendered).display(),
            matches = matches.len(),
            "resolved path template"
        );

        if matches.is_empty() && template.is_strict() {
            return Err(ResolutionError::NoMatch {
                pattern: root.join(&rendered).display().to_string(),
            });
        }

        Ok(matches)
    }

    /// Resolve a template that must name exactly one file
    pub fn resolve_one(
        template: &PathTemplate,
        context: &ExecutionContext,
    ) -> Result<PathBuf, ResolutionError> {
        let mut matches = Self::resolve(template, context)?;
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(ResolutionError::NoMatch {
                pattern: template.render_path(context)?.display().to_string(),
            }),
            count => Err(ResolutionError::Ambiguous {
                pattern: template.render_path(context)?.display().to_string(),
                count,
            }),
        }
    }

    /// Walk from the longest literal prefix and keep paths matching the pattern
    fn glob(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, ResolutionError> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| ResolutionError::InvalidTemplate {
                template: pattern.to_string(),
                message: e.to_string(),
            })?
            .compile_matcher();

        let (prefix, rest) = split_literal_prefix(pattern);
        let base = root.join(&prefix);
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut walker = WalkDir::new(&base).follow_links(true).min_depth(1);
        if !rest.iter().any(|component| component.contains("**")) {
            walker = walker.max_depth(rest.len());
        }

        let mut matches = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| ResolutionError::Traversal {
                path: base.clone(),
                message: e.to_string(),
            })?;

            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            if matcher.is_match(relative) {
                matches.push(entry.into_path());
            }
        }

        matches.sort();
        Ok(matches)
    }
}

/// Split a pattern into its glob-free leading directories and the remaining components
fn split_literal_prefix(pattern: &str) -> (PathBuf, Vec<String>) {
    let mut prefix = PathBuf::new();
    let mut rest = Vec::new();

    for component in Path::new(pattern).components() {
        let Component::Normal(part) = component else {
            prefix.push(component.as_os_str());
            continue;
        };
        let part = part.to_string_lossy();
        if rest.is_empty() && !is_glob(&part) {
            prefix.push(part.as_ref());
        } else {
            rest.push(part.into_owned());
        }
    }

    (prefix, rest)
}
