//! The opaque handle returned by a passed admission check.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::chain::{panic_message, SlotChain};
use crate::context::EntryContext;
use crate::resource::ResourceWrapper;

/// Handle for one admitted call.
///
/// `exit()` settles accounting at most once; dropping an un-exited handle
/// settles it too, so a passed call can never leak concurrency. The handle
/// owns its pooled context and returns it on exit.
pub struct Entry {
    ctx: Option<Box<EntryContext>>,
    res: Arc<ResourceWrapper>,
    chain: Arc<SlotChain>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry").finish_non_exhaustive()
    }
}

impl Entry {
    pub(crate) fn new(ctx: Box<EntryContext>, res: Arc<ResourceWrapper>, chain: Arc<SlotChain>) -> Self {
        Self { ctx: Some(ctx), res, chain }
    }

    pub fn resource(&self) -> &ResourceWrapper {
        &self.res
    }

    /// The live context, if the entry has not exited yet.
    pub fn context(&self) -> Option<&EntryContext> {
        self.ctx.as_deref()
    }

    /// Attach a business error to be recorded at exit.
    pub fn set_error(&mut self, err: Arc<dyn std::error::Error + Send + Sync>) {
        if let Some(ctx) = self.ctx.as_deref_mut() {
            ctx.set_error(err);
        }
    }

    /// Register a hook run during exit, before stat completion.
    pub fn when_exit(&mut self, hook: impl FnOnce(&mut EntryContext) + Send + 'static) {
        if let Some(ctx) = self.ctx.as_deref_mut() {
            ctx.when_exit(hook);
        }
    }

    /// Finish the call. Idempotent: repeated calls are no-ops.
    pub fn exit(&mut self) {
        self.do_exit();
    }

    /// Finish the call, recording `err` as its business error first.
    pub fn exit_with_error(&mut self, err: Arc<dyn std::error::Error + Send + Sync>) {
        self.set_error(err);
        self.do_exit();
    }

    fn do_exit(&mut self) {
        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        let hooks = std::mem::take(&mut ctx.exit_hooks);
        for hook in hooks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(&mut ctx))) {
                tracing::error!(
                    resource = self.res.name(),
                    panic = %panic_message(payload),
                    "exit hook panicked"
                );
            }
        }
        self.chain.run_exit(&mut ctx);
        self.chain.refurbish_context(ctx);
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.do_exit();
    }
}
