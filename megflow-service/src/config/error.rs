// Configuration error types
// Location, source context and suggestions for descriptor mistakes

use std::fmt;

/// Detailed configuration error with location and context
#[derive(Debug, Clone)]
pub struct ConfigError {
    /// Error message
    pub message: String,
    /// Dotted key path the error refers to (e.g. `inverse.snr`), when known
    pub key: Option<String>,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// Surrounding source lines
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    /// The kind of error
    pub kind: ConfigErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// YAML/JSON syntax error
    Syntax,
    /// A required key is absent
    MissingKey,
    /// Unrecognised key
    UnknownKey,
    /// Wrong type or out-of-range value
    InvalidValue,
    /// Descriptor could not be read
    Io,
}

impl ConfigError {
    pub fn new(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
            kind,
        }
    }

    pub fn missing_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(
            ConfigErrorKind::MissingKey,
            format!("missing required key '{}'", key),
        )
        .with_key(key)
    }

    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConfigErrorKind::InvalidValue, message).with_key(key)
    }

    pub fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::new(
            ConfigErrorKind::Io,
            format!("failed to read descriptor {}: {}", path.display(), err),
        )
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_location(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    fn with_suggestion_opt(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }

    /// Attach the source lines around the error location
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let marker = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));

            if line_num == self.line && self.column > 0 {
                context.push_str(&format!("       | {}^\n", " ".repeat(self.column)));
            }
        }

        self.context = context;
        self
    }

    /// Create from a serde_yaml error
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));
        Self::from_serde_message(&err.to_string(), source, line, column)
    }

    /// Create from a serde_json error
    pub fn from_json_error(err: &serde_json::Error, source: &str) -> Self {
        let kind = match err.classify() {
            serde_json::error::Category::Syntax | serde_json::error::Category::Eof => {
                Some(ConfigErrorKind::Syntax)
            }
            _ => None,
        };
        let error = Self::from_serde_message(&err.to_string(), source, err.line(), err.column());
        match kind {
            Some(kind) => Self { kind, ..error },
            None => error,
        }
    }

    fn from_serde_message(msg: &str, source: &str, line: usize, column: usize) -> Self {
        let (kind, message, key) = classify_message(msg);
        let suggestion = suggest_fix(kind, key.as_deref(), msg);

        let mut error = ConfigError::new(kind, message)
            .with_location(line, column)
            .with_source_context(source, 2)
            .with_suggestion_opt(suggestion);
        error.key = key;
        error
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.message)?;
        if self.line > 0 {
            write!(f, " (line {}:{})", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context.trim_end())?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            write!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ConfigError {}

/// Turn a raw serde message into (kind, readable message, key)
fn classify_message(msg: &str) -> (ConfigErrorKind, String, Option<String>) {
    // serde appends " at line X column Y" which is reported separately
    let msg = msg.split(" at line ").next().unwrap_or(msg);

    if let Some(field) = extract_between(msg, "missing field `", "`") {
        return (
            ConfigErrorKind::MissingKey,
            format!("missing required key '{}'", field),
            Some(field),
        );
    }

    if let Some(field) = extract_between(msg, "unknown field `", "`") {
        let message = match expected_fields(msg) {
            Some(expected) => format!(
                "unknown key '{}', expected one of: {}",
                field,
                expected.join(", ")
            ),
            None => format!("unknown key '{}'", field),
        };
        return (ConfigErrorKind::UnknownKey, message, Some(field));
    }

    if msg.contains("invalid type") || msg.contains("invalid value") {
        let key = msg
            .split_once(": invalid")
            .map(|(path, _)| path.trim().to_string())
            .filter(|path| !path.is_empty() && !path.contains(' '));
        return (ConfigErrorKind::InvalidValue, msg.to_string(), key);
    }

    (ConfigErrorKind::Syntax, msg.to_string(), None)
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn expected_fields(msg: &str) -> Option<Vec<String>> {
    let start = msg.find("expected one of ")? + "expected one of ".len();
    let fields = msg[start..]
        .split(", ")
        .map(|s| s.trim().trim_matches('`').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Some(fields)
}

/// Suggest fixes for common descriptor mistakes
fn suggest_fix(kind: ConfigErrorKind, key: Option<&str>, msg: &str) -> Option<String> {
    match (kind, key) {
        (ConfigErrorKind::MissingKey, Some("jobs")) => {
            Some("add 'jobs: 4' to set the number of parallel workers".to_string())
        }
        (ConfigErrorKind::MissingKey, Some("subject_ids")) => {
            Some("list the subjects to process, e.g. 'subject_ids: [sub001, sub002]'".to_string())
        }
        (ConfigErrorKind::MissingKey, Some("paths")) => Some(
            "add a 'paths:' section with data_root, mri_root and subjects_dir".to_string(),
        ),
        (ConfigErrorKind::MissingKey, Some(key)) => Some(format!("add '{}:' to the descriptor", key)),
        (ConfigErrorKind::UnknownKey, Some(key)) => {
            let typos = [
                ("subjects", "subject_ids"),
                ("subject_id", "subject_ids"),
                ("n_jobs", "jobs"),
                ("njobs", "jobs"),
                ("subjects_directory", "subjects_dir"),
                ("exclude", "exclude_subjects"),
                ("parc", "parcellation"),
            ];
            typos
                .iter()
                .find(|(typo, _)| key.eq_ignore_ascii_case(typo))
                .map(|(_, correct)| format!("did you mean '{}'?", correct))
        }
        (ConfigErrorKind::Syntax, _) if msg.contains("tab") => Some(
            "YAML does not allow tabs for indentation. Replace tabs with spaces.".to_string(),
        ),
        _ => None,
    }
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;
