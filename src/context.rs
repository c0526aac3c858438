use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::Span;

/// Cooperative cancellation, checked by the estimator between steps.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Diagnostics handed down to a run: the span its events are recorded in,
/// an optional progress callback and an optional cancellation flag.
pub struct RunContext<'a> {
    span: Span,
    progress: Option<Box<dyn FnMut(f64) + 'a>>,
    cancel: Option<CancelFlag>,
}

impl<'a> RunContext<'a> {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            progress: None,
            cancel: None,
        }
    }

    /// Calls `progress` with the completed fraction of the run after every step.
    pub fn with_progress(mut self, progress: impl FnMut(f64) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn report_progress(&mut self, fraction: f64) {
        if let Some(progress) = &mut self.progress {
            progress(fraction);
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }
}

impl Default for RunContext<'_> {
    fn default() -> Self {
        Self::new(tracing::info_span!("estimate"))
    }
}
