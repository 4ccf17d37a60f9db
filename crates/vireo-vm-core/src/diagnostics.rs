//! Per-VM diagnostic sink
//!
//! Recoverable conditions (coercion warnings, division by zero, undefined
//! variables/indexes/properties) are reported here and never interrupt
//! execution. The sink also owns the display-mode flag: variable names in
//! messages are formatted per the front-end's syntax style.

/// Severity of a recoverable diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational (undefined variable reads and the like)
    Notice,
    /// Suspicious but recoverable (division by zero, lossy coercion)
    Warning,
}

/// Kind of recoverable condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Division by zero produced the IEEE sentinel
    DivisionByZero,
    /// Read of a variable that was never written
    UndefinedVariable,
    /// Array index past the end
    UndefinedIndex,
    /// Property absent from the object's shape
    UndefinedProperty,
    /// Coercion lost precision
    CoercionLoss,
    /// Call with out-of-range argument count
    ArityMismatch,
}

/// One recorded diagnostic
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity
    pub severity: Severity,
    /// Kind
    pub kind: DiagnosticKind,
    /// Formatted message
    pub message: String,
    /// Source line, when known
    pub line: Option<u32>,
}

/// How variable names render in messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    /// `$name` (PHP-style prefixed)
    #[default]
    DollarPrefixed,
    /// Bare `name`
    Plain,
}

/// Collects recoverable diagnostics for one VM instance
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    entries: Vec<Diagnostic>,
    mode: DisplayMode,
}

impl DiagnosticSink {
    /// Create a sink with a display mode
    pub fn new(mode: DisplayMode) -> Self {
        Self {
            entries: Vec::new(),
            mode,
        }
    }

    /// Format a variable name per the display mode
    pub fn format_var(&self, name: &str) -> String {
        match self.mode {
            DisplayMode::DollarPrefixed => format!("${name}"),
            DisplayMode::Plain => name.to_string(),
        }
    }

    /// Record a diagnostic
    pub fn report(
        &mut self,
        severity: Severity,
        kind: DiagnosticKind,
        message: impl Into<String>,
        line: Option<u32>,
    ) {
        self.entries.push(Diagnostic {
            severity,
            kind,
            message: message.into(),
            line,
        });
    }

    /// Number of recorded diagnostics
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the sink empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Borrow the recorded diagnostics
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Take all recorded diagnostics
    pub fn drain(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.entries)
    }
}
