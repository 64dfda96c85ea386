//! Structured decode diagnostics for the EnergyNet wire codec.
//!
//! Decoders in [`energynet-wire`](https://docs.rs/energynet-wire) don't
//! return `Result` for recoverable problems (an unknown enum id, a
//! skippable malformed entry in a composite value). Instead they record
//! a [`Diagnostic`] against a [`DiagnosticCollector`] reachable through a
//! thread-local stack, the way a serializer framework without a
//! collector parameter threaded through every nested call would. A
//! [`DiagnosticScope`] is the RAII guard that pushes/pops that stack,
//! with restore-on-drop so an early `?` return in a decoder never
//! leaves a stale collector behind.

use std::cell::RefCell;

/// Severity of a recorded [`Diagnostic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    /// The decode succeeded despite this condition.
    Warning,
    /// The decode failed because of this condition.
    Error,
}

/// A single structured diagnostic recorded during decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable, machine-matchable code, e.g. `"UNKNOWN_MESSAGE_TYPE"`.
    pub code: &'static str,
    pub message: String,
    pub byte_offset: Option<usize>,
    pub field_path: Option<String>,
}

impl Diagnostic {
    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            message: message.into(),
            byte_offset: None,
            field_path: None,
        }
    }

    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
            byte_offset: None,
            field_path: None,
        }
    }

    #[must_use]
    pub fn with_byte_offset(mut self, offset: usize) -> Self {
        self.byte_offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// An ordered list of [`Diagnostic`]s accumulated during one decode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticCollector {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn warning(&mut self, code: &'static str, message: impl Into<String>) {
        self.push(Diagnostic::warning(code, message));
    }

    pub fn error(&mut self, code: &'static str, message: impl Into<String>) {
        self.push(Diagnostic::error(code, message));
    }

    /// Append another collector's diagnostics in order, typically used
    /// to bubble a nested decoder's diagnostics into its caller's.
    pub fn extend(&mut self, other: DiagnosticCollector) {
        self.diagnostics.extend(other.diagnostics);
    }

    /// Same as [`Self::extend`] but prefixes every bubbled diagnostic's
    /// `field_path` with `prefix.`, so a nested decode of e.g. a
    /// composite value's inner field reads as `"powerMix.entries[2]"`
    /// rather than just `"entries[2]"`.
    pub fn extend_prefixed(&mut self, prefix: &str, other: DiagnosticCollector) {
        for mut d in other.diagnostics {
            d.field_path = Some(match d.field_path {
                Some(existing) => format!("{prefix}.{existing}"),
                None => prefix.to_string(),
            });
            self.diagnostics.push(d);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn as_slice(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    /// Promote every `Warning` in place to `Error`. Used by strict-mode
    /// message parsing (§4.3): a successful-but-warned lenient parse
    /// becomes a failed strict parse.
    pub fn promote_warnings_to_errors(&mut self) {
        for d in &mut self.diagnostics {
            d.severity = Severity::Error;
        }
    }
}

impl IntoIterator for DiagnosticCollector {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.into_iter()
    }
}

thread_local! {
    static STACK: RefCell<Vec<DiagnosticCollector>> = const { RefCell::new(Vec::new()) };
}

fn with_top_mut<R>(f: impl FnOnce(&mut DiagnosticCollector) -> R) -> R {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.is_empty() {
            // No enclosing DiagnosticScope — start an implicit root rather
            // than panicking or silently dropping the diagnostic.
            stack.push(DiagnosticCollector::new());
        }
        f(stack.last_mut().expect("just pushed"))
    })
}

/// Record a warning against the innermost active [`DiagnosticScope`].
pub fn warning(code: &'static str, message: impl Into<String>) {
    with_top_mut(|c| c.warning(code, message));
}

/// Record an error against the innermost active [`DiagnosticScope`].
pub fn error(code: &'static str, message: impl Into<String>) {
    with_top_mut(|c| c.error(code, message));
}

/// Record a fully-built [`Diagnostic`] against the innermost active scope.
pub fn record(diagnostic: Diagnostic) {
    with_top_mut(|c| c.push(diagnostic));
}

/// Scoped access to a thread-local [`DiagnosticCollector`] for nested
/// decoders.
///
/// `DiagnosticScope::enter` pushes a fresh collector onto the
/// thread-local stack; every call to the free functions [`warning`],
/// [`error`], and [`record`] anywhere on this thread — including deep
/// in nested decode calls that have no explicit handle to the scope —
/// appends to that collector until the scope ends.
///
/// The scope ends either by calling [`DiagnosticScope::finish`]
/// explicitly, or implicitly on drop (covering the `?`-propagation
/// case where a decoder bails out before reaching its own cleanup
/// code). Either way the previous (outer) collector, if any, is
/// restored and receives this scope's diagnostics appended to it —
/// bubbling nested-decoder diagnostics up automatically. The outermost
/// scope in a call chain is the one callers actually inspect; retrieve
/// its diagnostics via [`DiagnosticScope::finish`] before the guard
/// drops, since a dropped-without-finishing scope still bubbles them to
/// its parent (or discards them if it had none).
pub struct DiagnosticScope {
    finished: bool,
}

impl DiagnosticScope {
    #[must_use]
    pub fn enter() -> Self {
        STACK.with(|stack| stack.borrow_mut().push(DiagnosticCollector::new()));
        Self { finished: false }
    }

    /// Pop this scope's collector, merge it into the new top of stack
    /// (if any), and return the popped collector to the caller.
    pub fn finish(mut self) -> DiagnosticCollector {
        self.finished = true;
        self.pop_and_bubble()
    }

    fn pop_and_bubble(&self) -> DiagnosticCollector {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let popped = stack.pop().unwrap_or_default();
            if let Some(parent) = stack.last_mut() {
                parent.extend(popped.clone());
            }
            popped
        })
    }
}

impl Drop for DiagnosticScope {
    fn drop(&mut self) {
        if !self.finished {
            self.pop_and_bubble();
        }
    }
}
