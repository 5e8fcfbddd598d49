//! User-pluggable transforms for input, output, and finished tapes.
//!
//! Decorators are small single-method capabilities: values or adapters around
//! plain functions. They run on the recording path only — input decorators
//! before key building and persistence, output decorators before redaction,
//! the tape decorator once at finalize. They must be pure; the store never
//! observes their side effects because they are not allowed to have any.

use std::sync::Arc;

use crate::matching::MatchingContext;
use crate::tape::Tape;

/// Transforms input bytes before they are recorded and matched.
pub trait InputDecorator: Send + Sync {
    fn decorate(&self, ctx: &MatchingContext, data: &[u8]) -> Vec<u8>;
}

impl<F> InputDecorator for F
where
    F: Fn(&MatchingContext, &[u8]) -> Vec<u8> + Send + Sync,
{
    fn decorate(&self, ctx: &MatchingContext, data: &[u8]) -> Vec<u8> {
        self(ctx, data)
    }
}

/// Transforms output chunk bytes before redaction and persistence.
pub trait OutputDecorator: Send + Sync {
    fn decorate(&self, ctx: &MatchingContext, data: &[u8]) -> Vec<u8>;
}

/// Transforms the finished tape once, at finalize.
pub trait TapeDecorator: Send + Sync {
    fn decorate(&self, ctx: &MatchingContext, tape: Tape) -> Tape;
}

impl<F> TapeDecorator for F
where
    F: Fn(&MatchingContext, Tape) -> Tape + Send + Sync,
{
    fn decorate(&self, ctx: &MatchingContext, tape: Tape) -> Tape {
        self(ctx, tape)
    }
}

/// Adapter so plain functions can serve as output decorators.
pub struct OutputFn<F>(pub F);

impl<F> OutputDecorator for OutputFn<F>
where
    F: Fn(&MatchingContext, &[u8]) -> Vec<u8> + Send + Sync,
{
    fn decorate(&self, ctx: &MatchingContext, data: &[u8]) -> Vec<u8> {
        (self.0)(ctx, data)
    }
}

/// The decorators configured for one session.
#[derive(Clone, Default)]
pub struct DecoratorSet {
    pub input: Option<Arc<dyn InputDecorator>>,
    pub output: Option<Arc<dyn OutputDecorator>>,
    pub tape: Option<Arc<dyn TapeDecorator>>,
}

impl DecoratorSet {
    /// Apply the input decorator, if any.
    #[must_use]
    pub fn decorate_input(&self, ctx: &MatchingContext, data: &[u8]) -> Vec<u8> {
        match &self.input {
            Some(d) => d.decorate(ctx, data),
            None => data.to_vec(),
        }
    }

    /// Apply the output decorator, if any.
    #[must_use]
    pub fn decorate_output(&self, ctx: &MatchingContext, data: &[u8]) -> Vec<u8> {
        match &self.output {
            Some(d) => d.decorate(ctx, data),
            None => data.to_vec(),
        }
    }

    /// Apply the tape decorator, if any.
    #[must_use]
    pub fn decorate_tape(&self, ctx: &MatchingContext, tape: Tape) -> Tape {
        match &self.tape {
            Some(d) => d.decorate(ctx, tape),
            None => tape,
        }
    }
}

impl std::fmt::Debug for DecoratorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoratorSet")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("tape", &self.tape.is_some())
            .finish()
    }
}
