//! Engine values that keep their runtime alive
//!
//! A bare `Persistent` does not own its runtime. If the last [`Engine`] clone
//! goes away first, QuickJS finds the value still linked when the runtime is
//! freed and aborts the process. Every engine value this crate hands out is
//! wrapped in a [`Handle`] instead.

use crate::engine::Engine;
use rquickjs::{Ctx, JsLifetime, Persistent};
use std::fmt;

/// A saved engine value plus the engine it belongs to
///
/// Fields drop in declaration order, so the value is released before the
/// engine clone.
pub struct Handle<T> {
    value: Persistent<T>,
    engine: Engine,
}

impl<T> Handle<T> {
    pub(crate) fn new(engine: &Engine, value: Persistent<T>) -> Self {
        Self {
            value,
            engine: engine.clone(),
        }
    }

    /// Engine the value lives in
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Restore the value in `ctx`, which must belong to the same engine
    pub fn restore<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<T::Changed<'js>>
    where
        T: JsLifetime<'static> + Clone,
    {
        self.value.clone().restore(ctx)
    }

    /// The underlying saved value
    ///
    /// A clone of it does not keep the engine alive; it must be dropped before
    /// the last [`Engine`] clone.
    pub fn persistent(&self) -> &Persistent<T> {
        &self.value
    }
}

impl<T: Clone> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}
