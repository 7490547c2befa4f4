//! Extensions: observers and mutators attached to pipeline lifecycle points.
//!
//! An [`Extension`] implements any subset of six hooks; the rest default to
//! no-ops. An [`ExtensionChain`] invokes every registered extension in
//! registration order and attributes failures to the hook and extension that
//! raised them.
//!
//! # Example
//!
//! ```ignore
//! struct CountBlocks(u64);
//!
//! impl<T> Extension<T> for CountBlocks {
//!     fn post_block(&mut self, _: ExecutionState<'_, T>, _: &mut RunContext<'_>) -> Result<()> {
//!         self.0 += 1;
//!         Ok(())
//!     }
//! }
//! ```

use anyhow::Result;

use crate::context::{ExecutionState, RunContext};
use crate::error::{HookKind, ReplayError};

/// Lifecycle hooks around a replay run.
pub trait Extension<T>: Send {
    /// Once, before any block is opened.
    fn pre_run(&mut self, _state: ExecutionState<'_, T>, _ctx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Once, after the run, on success or failure. `err` is the error that
    /// ended the run, if any.
    fn post_run(
        &mut self,
        _state: ExecutionState<'_, T>,
        _ctx: &mut RunContext<'_>,
        _err: Option<&anyhow::Error>,
    ) -> Result<()> {
        Ok(())
    }

    /// Before the backend's `begin_block`.
    fn pre_block(&mut self, _state: ExecutionState<'_, T>, _ctx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }

    /// After the backend's `end_block`.
    fn post_block(&mut self, _state: ExecutionState<'_, T>, _ctx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }

    fn pre_transaction(
        &mut self,
        _state: ExecutionState<'_, T>,
        _ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn post_transaction(
        &mut self,
        _state: ExecutionState<'_, T>,
        _ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    /// Name used in error messages.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }
}

/// An extension that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NilExtension;

impl<T> Extension<T> for NilExtension {}

/// Ordered list of extensions.
pub struct ExtensionChain<T> {
    extensions: Vec<Box<dyn Extension<T>>>,
}

impl<T> Default for ExtensionChain<T> {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
        }
    }
}

impl<T> ExtensionChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, extension: Box<dyn Extension<T>>) {
        self.extensions.push(extension);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn pre_run(&mut self, state: ExecutionState<'_, T>, ctx: &mut RunContext<'_>) -> Result<()> {
        self.dispatch(HookKind::PreRun, state, ctx, |e, s, c| e.pre_run(s, c))
    }

    pub fn pre_block(&mut self, state: ExecutionState<'_, T>, ctx: &mut RunContext<'_>) -> Result<()> {
        self.dispatch(HookKind::PreBlock, state, ctx, |e, s, c| e.pre_block(s, c))
    }

    pub fn post_block(&mut self, state: ExecutionState<'_, T>, ctx: &mut RunContext<'_>) -> Result<()> {
        self.dispatch(HookKind::PostBlock, state, ctx, |e, s, c| e.post_block(s, c))
    }

    pub fn pre_transaction(
        &mut self,
        state: ExecutionState<'_, T>,
        ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        self.dispatch(HookKind::PreTransaction, state, ctx, |e, s, c| {
            e.pre_transaction(s, c)
        })
    }

    pub fn post_transaction(
        &mut self,
        state: ExecutionState<'_, T>,
        ctx: &mut RunContext<'_>,
    ) -> Result<()> {
        self.dispatch(HookKind::PostTransaction, state, ctx, |e, s, c| {
            e.post_transaction(s, c)
        })
    }

    /// Invoke `post_run` on every extension, even after one fails.
    ///
    /// Returns the first failure.
    pub fn post_run(
        &mut self,
        state: ExecutionState<'_, T>,
        ctx: &mut RunContext<'_>,
        err: Option<&anyhow::Error>,
    ) -> Result<()> {
        let mut first: Option<anyhow::Error> = None;
        for extension in self.extensions.iter_mut() {
            if let Err(e) = extension.post_run(state, ctx, err) {
                let wrapped = hook_error(HookKind::PostRun, extension.as_ref(), state, e);
                match first {
                    None => first = Some(wrapped),
                    Some(_) => tracing::warn!(error = %wrapped, "additional PostRun failure"),
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops at the first failing extension.
    fn dispatch<F>(
        &mut self,
        hook: HookKind,
        state: ExecutionState<'_, T>,
        ctx: &mut RunContext<'_>,
        mut call: F,
    ) -> Result<()>
    where
        F: FnMut(&mut dyn Extension<T>, ExecutionState<'_, T>, &mut RunContext<'_>) -> Result<()>,
    {
        for extension in self.extensions.iter_mut() {
            if let Err(e) = call(extension.as_mut(), state, &mut *ctx) {
                return Err(hook_error(hook, extension.as_ref(), state, e));
            }
        }
        Ok(())
    }
}

fn hook_error<T>(
    hook: HookKind,
    extension: &dyn Extension<T>,
    state: ExecutionState<'_, T>,
    source: anyhow::Error,
) -> anyhow::Error {
    let (block, transaction) = match hook {
        HookKind::PreRun | HookKind::PostRun => (None, None),
        HookKind::PreBlock | HookKind::PostBlock => (Some(state.block), None),
        HookKind::PreTransaction | HookKind::PostTransaction => {
            (Some(state.block), Some(state.transaction))
        }
    };
    ReplayError::Hook {
        hook,
        extension: extension.name(),
        block,
        transaction,
        source,
    }
    .into()
}
