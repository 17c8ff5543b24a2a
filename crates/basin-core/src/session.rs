//! Engine session with a guaranteed finalizer.
//!
//! A `Session` owns the engine and the single scope slot for the lifetime of
//! the process. Starting a session clears any mask left behind by an aborted
//! run; dropping it releases the active scope, removes registered temporary
//! products and clears a stray mask. All cleanup checks before it removes, so
//! it is safe to run any number of times.
//!
//! Long-running work polls the session's cancel flag between stages and
//! months. Tools set it from their interrupt handler, so an interrupted run
//! unwinds through the same guards and finalizer as a normal one.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::{Engine, EngineCommand, MapElement};
use crate::error::PipelineError;
use crate::naming::ProductId;
use crate::scope::{unmask_command, ScopeHandle, ScopeManager, ScopeSpec, ScopeStats};

const MASK: &str = "MASK";

pub struct Session<E: Engine> {
    engine: E,
    scopes: ScopeManager,
    temporaries: BTreeSet<(MapElement, ProductId)>,
    cancel: Arc<AtomicBool>,
}

impl<E: Engine> Session<E> {
    /// Take ownership of `engine` and clear any stray mask.
    pub fn start(engine: E) -> Result<Self, PipelineError> {
        let mut session = Self {
            engine,
            scopes: ScopeManager::new(),
            temporaries: BTreeSet::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        if session.purge_mask()? {
            tracing::warn!("removed a mask left behind by a previous run");
        }
        Ok(session)
    }

    /// Share `flag` as the session's cancel flag.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// `Err(Cancelled)` once the cancel flag is set.
    pub fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.load(Ordering::SeqCst) {
            tracing::warn!("interrupt received; stopping");
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    pub fn engine(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn scope_stats(&self) -> ScopeStats {
        self.scopes.stats()
    }

    pub fn scope_active(&self) -> bool {
        self.scopes.is_active()
    }

    /// Acquire `spec` and return a guard that releases it on every exit path.
    pub fn scoped(&mut self, spec: &ScopeSpec) -> Result<ScopeGuard<'_, E>, PipelineError> {
        let handle = self.scopes.acquire(&mut self.engine, spec)?;
        Ok(ScopeGuard { session: self, handle, released: false })
    }

    /// Schedule `product` for removal when the session finishes.
    pub fn register_temporary(&mut self, element: MapElement, product: ProductId) {
        self.temporaries.insert((element, product));
    }

    pub fn temporaries(&self) -> impl Iterator<Item = &ProductId> {
        self.temporaries.iter().map(|(_, p)| p)
    }

    /// Remove the engine mask if one exists. Returns whether one was removed.
    pub fn purge_mask(&mut self) -> Result<bool, PipelineError> {
        if !self.engine.exists(MapElement::Raster, MASK)? {
            return Ok(false);
        }
        self.engine.run(&unmask_command())?;
        Ok(true)
    }

    /// Run the finalizer now and report its errors. Dropping the session runs
    /// it again, which only removes what was registered since.
    pub fn finish(&mut self) -> Result<(), PipelineError> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Result<(), PipelineError> {
        let mut first_err: Option<PipelineError> = None;

        if let Some(handle) = self.scopes.active_handle() {
            if let Err(e) = self.scopes.release(&mut self.engine, handle) {
                first_err.get_or_insert(e);
            }
        }

        for element in [MapElement::Raster, MapElement::Vector] {
            if let Err(e) = self.remove_temporaries(element) {
                first_err.get_or_insert(e);
            }
        }

        if let Err(e) = self.purge_mask() {
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn remove_temporaries(&mut self, element: MapElement) -> Result<(), PipelineError> {
        let candidates: Vec<ProductId> = self
            .temporaries
            .iter()
            .filter(|(e, _)| *e == element)
            .map(|(_, p)| p.clone())
            .collect();

        let mut present = Vec::new();
        for product in &candidates {
            if self.engine.exists(element, product.as_str())? {
                present.push(product.to_string());
            }
        }
        if !present.is_empty() {
            tracing::info!(kind = element.type_name(), count = present.len(), "removing temporary products");
            self.engine.run(
                &EngineCommand::new("g.remove")
                    .param("type", element.type_name())
                    .param("name", present)
                    .flags("f"),
            )?;
        }
        self.temporaries.retain(|(e, _)| *e != element);
        Ok(())
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::error!(error = %e, "session cleanup failed");
        }
    }
}

// ── Scope guard ───────────────────────────────────────────────────────────────

/// An acquired scope. Released exactly once: explicitly via [`ScopeGuard::release`]
/// or, on early return or panic, when dropped.
pub struct ScopeGuard<'s, E: Engine> {
    session: &'s mut Session<E>,
    handle: ScopeHandle,
    released: bool,
}

impl<'s, E: Engine> ScopeGuard<'s, E> {
    pub fn handle(&self) -> ScopeHandle {
        self.handle
    }

    pub fn engine(&mut self) -> &mut E {
        &mut self.session.engine
    }

    pub fn register_temporary(&mut self, element: MapElement, product: ProductId) {
        self.session.register_temporary(element, product);
    }

    pub fn check_cancelled(&self) -> Result<(), PipelineError> {
        self.session.check_cancelled()
    }

    /// Release the scope.
    ///
    /// If the engine fails to tear the scope down, the mask is checked and
    /// removed directly; only a mask that cannot be removed is an error, since
    /// it would clip every later basin.
    pub fn release(mut self) -> Result<(), PipelineError> {
        self.released = true;
        let session = &mut *self.session;
        match session.scopes.release(&mut session.engine, self.handle) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "scope release reported an error; verifying mask");
                session.purge_mask().map(|_| ())
            }
        }
    }
}

impl<E: Engine> Drop for ScopeGuard<'_, E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let session = &mut *self.session;
        if let Err(e) = session.scopes.release(&mut session.engine, self.handle) {
            tracing::error!(error = %e, "scope release on unwind failed");
            if let Err(e) = session.purge_mask() {
                tracing::error!(error = %e, "mask could not be removed");
            }
        }
    }
}
