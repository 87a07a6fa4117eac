//! Engine-side state shared by the synthetic global's traps
//!
//! The [`InterceptorBinding`] is owned by its sandbox context through an
//! `Rc`. Traps registered on the synthetic global only hold a `Weak` to it:
//! a strong reference stored inside an engine function would be a root the
//! garbage collector cannot see through, and would keep the whole sandbox
//! context alive for as long as the runtime exists.

use crate::interceptor::{Interceptor, PropertyStore};
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};

/// Name of the real-global binding the runner uses to reach the synthetic
/// global and the pending source
pub const SCOPE_BINDING: &str = "__contextify__";

/// Progress of the current `run` call, as observed by the traps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunPhase {
    /// No run in progress
    Idle,
    /// The runner wrapper is resolving its own identifiers
    Armed,
    /// Source handed to the wrapper's `eval`; script code owns the global
    Executing,
}

/// `Reflect` functions and the realm's `eval`, captured from the isolated
/// context at creation before any script can replace them
#[derive(Clone)]
pub(crate) struct Reflect<'js> {
    eval: Function<'js>,
    has: Function<'js>,
    get: Function<'js>,
    set: Function<'js>,
    delete_property: Function<'js>,
    own_keys: Function<'js>,
    get_own_property_descriptor: Function<'js>,
    define_property: Function<'js>,
}

impl<'js> Reflect<'js> {
    pub(crate) fn capture(ctx: &Ctx<'js>) -> rquickjs::Result<Self> {
        let globals = ctx.globals();
        let reflect: Object<'js> = globals.get("Reflect")?;
        Ok(Self {
            eval: globals.get("eval")?,
            has: reflect.get("has")?,
            get: reflect.get("get")?,
            set: reflect.get("set")?,
            delete_property: reflect.get("deleteProperty")?,
            own_keys: reflect.get("ownKeys")?,
            get_own_property_descriptor: reflect.get("getOwnPropertyDescriptor")?,
            define_property: reflect.get("defineProperty")?,
        })
    }

    fn save(&self, ctx: &Ctx<'js>) -> SavedReflect {
        SavedReflect {
            eval: Persistent::save(ctx, self.eval.clone()),
            has: Persistent::save(ctx, self.has.clone()),
            get: Persistent::save(ctx, self.get.clone()),
            set: Persistent::save(ctx, self.set.clone()),
            delete_property: Persistent::save(ctx, self.delete_property.clone()),
            own_keys: Persistent::save(ctx, self.own_keys.clone()),
            get_own_property_descriptor: Persistent::save(
                ctx,
                self.get_own_property_descriptor.clone(),
            ),
            define_property: Persistent::save(ctx, self.define_property.clone()),
        }
    }

    /// The realm's own `eval`, the only function a direct eval can call
    pub(crate) fn intrinsic_eval(&self) -> &Function<'js> {
        &self.eval
    }

    /// `Reflect.getOwnPropertyDescriptor(object, key)`; `undefined` if absent
    pub(crate) fn own_descriptor(
        &self,
        object: &Object<'js>,
        key: &Value<'js>,
    ) -> rquickjs::Result<Value<'js>> {
        self.get_own_property_descriptor
            .call((object.clone(), key.clone()))
    }

    /// `Reflect.defineProperty(object, key, descriptor)`
    pub(crate) fn define(
        &self,
        object: &Object<'js>,
        key: &Value<'js>,
        descriptor: Value<'js>,
    ) -> rquickjs::Result<bool> {
        self.define_property
            .call((object.clone(), key.clone(), descriptor))
    }

    /// `Reflect.ownKeys(object)`
    pub(crate) fn keys(&self, object: &Object<'js>) -> rquickjs::Result<Vec<Value<'js>>> {
        self.own_keys.call((object.clone(),))
    }

    /// `Reflect.get(object, key)`
    pub(crate) fn read(
        &self,
        object: &Object<'js>,
        key: &Value<'js>,
    ) -> rquickjs::Result<Value<'js>> {
        self.get.call((object.clone(), key.clone()))
    }

    /// `Reflect.set(object, key, value)`
    pub(crate) fn write(
        &self,
        object: &Object<'js>,
        key: &Value<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<bool> {
        self.set.call((object.clone(), key.clone(), value))
    }

    /// `Reflect.deleteProperty(object, key)`
    pub(crate) fn remove(&self, object: &Object<'js>, key: &Value<'js>) -> rquickjs::Result<bool> {
        self.delete_property.call((object.clone(), key.clone()))
    }
}

struct SavedReflect {
    eval: Persistent<Function<'static>>,
    has: Persistent<Function<'static>>,
    get: Persistent<Function<'static>>,
    set: Persistent<Function<'static>>,
    delete_property: Persistent<Function<'static>>,
    own_keys: Persistent<Function<'static>>,
    get_own_property_descriptor: Persistent<Function<'static>>,
    define_property: Persistent<Function<'static>>,
}

impl SavedReflect {
    fn restore<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Reflect<'js>> {
        Ok(Reflect {
            eval: self.eval.clone().restore(ctx)?,
            has: self.has.clone().restore(ctx)?,
            get: self.get.clone().restore(ctx)?,
            set: self.set.clone().restore(ctx)?,
            delete_property: self.delete_property.clone().restore(ctx)?,
            own_keys: self.own_keys.clone().restore(ctx)?,
            get_own_property_descriptor: self.get_own_property_descriptor.clone().restore(ctx)?,
            define_property: self.define_property.clone().restore(ctx)?,
        })
    }
}

/// [`PropertyStore`] over an engine object, driven through `Reflect`
pub(crate) struct JsObjectStore<'js> {
    object: Object<'js>,
    reflect: Reflect<'js>,
}

impl<'js> JsObjectStore<'js> {
    pub(crate) fn new(object: Object<'js>, reflect: Reflect<'js>) -> Self {
        Self { object, reflect }
    }

    pub(crate) fn object(&self) -> &Object<'js> {
        &self.object
    }

    pub(crate) fn reflect(&self) -> &Reflect<'js> {
        &self.reflect
    }
}

impl<'js> PropertyStore for JsObjectStore<'js> {
    type Key = Value<'js>;
    type Value = Value<'js>;
    type Error = rquickjs::Error;

    fn contains(&self, key: &Value<'js>) -> rquickjs::Result<bool> {
        self.reflect.has.call((self.object.clone(), key.clone()))
    }

    fn contains_own(&self, key: &Value<'js>) -> rquickjs::Result<bool> {
        Ok(!self.reflect.own_descriptor(&self.object, key)?.is_undefined())
    }

    fn read(&self, key: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        self.reflect.read(&self.object, key)
    }

    fn write(&self, key: &Value<'js>, value: Value<'js>) -> rquickjs::Result<bool> {
        self.reflect.write(&self.object, key, value)
    }

    fn remove(&self, key: &Value<'js>) -> rquickjs::Result<bool> {
        self.reflect.remove(&self.object, key)
    }

    fn own_keys(&self) -> rquickjs::Result<Vec<Value<'js>>> {
        self.reflect.keys(&self.object)
    }
}

/// Sandbox and real-global stores restored for one trap invocation
pub(crate) struct TrapStores<'js> {
    pub(crate) sandbox: JsObjectStore<'js>,
    pub(crate) global: JsObjectStore<'js>,
}

impl<'js> TrapStores<'js> {
    pub(crate) fn interceptor(&self) -> Interceptor<'_, JsObjectStore<'js>> {
        Interceptor::new(&self.sandbox, &self.global)
    }
}

/// Everything a trap needs to recover the sandbox context it belongs to
pub(crate) struct InterceptorBinding {
    sandbox: Persistent<Object<'static>>,
    real_global: Persistent<Object<'static>>,
    reflect: SavedReflect,
    baseline: HashSet<String>,
    pinned: RefCell<HashSet<String>>,
    phase: Cell<RunPhase>,
    pending_source: RefCell<Option<String>>,
}

impl InterceptorBinding {
    pub(crate) fn new<'js>(
        ctx: &Ctx<'js>,
        sandbox: Object<'js>,
        real_global: Object<'js>,
        reflect: &Reflect<'js>,
        baseline: HashSet<String>,
    ) -> Self {
        Self {
            sandbox: Persistent::save(ctx, sandbox),
            real_global: Persistent::save(ctx, real_global),
            reflect: reflect.save(ctx),
            baseline,
            pinned: RefCell::new(HashSet::new()),
            phase: Cell::new(RunPhase::Idle),
            pending_source: RefCell::new(None),
        }
    }

    /// Whether `key` existed on the real global when the context was created
    pub(crate) fn in_baseline(&self, key: &str) -> bool {
        self.baseline.contains(key)
    }

    /// Record a leaked key the real global refused to give up
    ///
    /// Returns `false` if it was already pinned.
    pub(crate) fn pin(&self, key: &str) -> bool {
        self.pinned.borrow_mut().insert(key.to_string())
    }

    pub(crate) fn is_pinned(&self, key: &str) -> bool {
        self.pinned.borrow().contains(key)
    }

    pub(crate) fn stores<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<TrapStores<'js>> {
        let reflect = self.reflect.restore(ctx)?;
        Ok(TrapStores {
            sandbox: JsObjectStore::new(self.sandbox.clone().restore(ctx)?, reflect.clone()),
            global: JsObjectStore::new(self.real_global.clone().restore(ctx)?, reflect),
        })
    }

    /// Hand `source` to the next wrapper evaluation
    pub(crate) fn arm(&self, source: &str) {
        *self.pending_source.borrow_mut() = Some(source.to_string());
        self.phase.set(RunPhase::Armed);
    }

    /// Clear per-run state
    pub(crate) fn disarm(&self) {
        self.pending_source.borrow_mut().take();
        self.phase.set(RunPhase::Idle);
    }

    /// Give the pending source to the wrapper; script code runs right after
    pub(crate) fn take_source(&self) -> Option<String> {
        let source = self.pending_source.borrow_mut().take();
        if source.is_some() {
            self.phase.set(RunPhase::Executing);
        }
        source
    }

    pub(crate) fn phase(&self) -> RunPhase {
        self.phase.get()
    }
}

/// Recover the binding behind a trap's token, or throw if it is gone
pub(crate) fn upgrade(
    ctx: &Ctx<'_>,
    token: &Weak<InterceptorBinding>,
) -> rquickjs::Result<Rc<InterceptorBinding>> {
    token
        .upgrade()
        .ok_or_else(|| Exception::throw_type(ctx, "sandbox context has been destroyed"))
}

/// Whether `key` is the reserved runner binding
pub(crate) fn is_scope_binding(key: &Value<'_>) -> bool {
    is_named(key, SCOPE_BINDING)
}

/// Whether `key` is the string `name`
pub(crate) fn is_named(key: &Value<'_>, name: &str) -> bool {
    key.as_string()
        .and_then(|s| s.to_string().ok())
        .is_some_and(|s| s == name)
}
