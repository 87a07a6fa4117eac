//! Construction of isolated contexts backed by a synthetic global
//!
//! The synthetic global is a `Proxy` over an empty target. Its handler traps
//! are native functions that recover their [`InterceptorBinding`] through a
//! weak token and forward to the [`crate::interceptor::Interceptor`].
//!
//! The isolated context also gets two real-global adjustments:
//!
//! - `globalThis` is rebound to the synthetic global, so `globalThis.k = v`
//!   is intercepted like a bare `k = v`.
//! - [`SCOPE_BINDING`] is defined non-writable and non-configurable. It
//!   exposes the synthetic global and the pending source to the runner
//!   wrapper.

use crate::binding::{
    is_named, is_scope_binding, upgrade, InterceptorBinding, Reflect, RunPhase, TrapStores,
    SCOPE_BINDING,
};
use crate::engine::Engine;
use crate::error::{ContextifyError, Result};
use crate::interceptor::PropertyStore;
use rquickjs::{Context, Ctx, Exception, Function, Object, Persistent, Value};
use std::collections::HashSet;
use std::rc::{Rc, Weak};

const PROXY_FACTORY: &str = "(function (target, handler) { return new Proxy(target, handler); })";

/// An isolated context and the binding its traps resolve to
pub(crate) struct IsolatedContext {
    pub(crate) context: Context,
    pub(crate) binding: Rc<InterceptorBinding>,
}

/// Result of [`create_context`]
pub(crate) struct CreatedContext {
    pub(crate) isolated: IsolatedContext,
    pub(crate) global_proxy: Persistent<Object<'static>>,
}

/// Build an isolated context whose global scope is routed to `sandbox`
///
/// Fails with a construction error if `sandbox` is not an object.
pub(crate) fn create_context(
    engine: &Engine,
    sandbox: &Persistent<Value<'static>>,
) -> Result<CreatedContext> {
    let context = engine.new_context()?;

    let (binding, global_proxy) = context.with(|ctx| -> Result<_> {
        let sandbox = sandbox.clone().restore(&ctx)?;
        let sandbox = match sandbox.as_object() {
            Some(object) => object.clone(),
            None => {
                return Err(ContextifyError::construction(format!(
                    "expected an object, got {}",
                    sandbox.type_name()
                )))
            }
        };

        let real_global = ctx.globals();
        let reflect = Reflect::capture(&ctx)?;

        let mut baseline = baseline_keys(&reflect, &real_global)?;
        baseline.insert(SCOPE_BINDING.to_string());

        let binding = Rc::new(InterceptorBinding::new(
            &ctx,
            sandbox,
            real_global.clone(),
            &reflect,
            baseline,
        ));
        let token = Rc::downgrade(&binding);
        let proxy = wire_global(&ctx, &reflect, &real_global, &token)?;

        Ok((binding, Persistent::save(&ctx, proxy)))
    })?;

    tracing::debug!("Created isolated context with synthetic global");

    Ok(CreatedContext {
        isolated: IsolatedContext { context, binding },
        global_proxy,
    })
}

/// Own string keys of the real global
fn baseline_keys<'js>(
    reflect: &Reflect<'js>,
    real_global: &Object<'js>,
) -> rquickjs::Result<HashSet<String>> {
    let mut keys = HashSet::new();
    for key in reflect.keys(real_global)? {
        if let Some(name) = key.as_string() {
            keys.insert(name.to_string()?);
        }
    }
    Ok(keys)
}

/// Create the synthetic global and bind it into the real global
fn wire_global<'js>(
    ctx: &Ctx<'js>,
    reflect: &Reflect<'js>,
    real_global: &Object<'js>,
    token: &Weak<InterceptorBinding>,
) -> rquickjs::Result<Object<'js>> {
    let target = Object::new(ctx.clone())?;
    let handler = build_handler(ctx, token)?;
    let factory: Function<'js> = ctx.eval(PROXY_FACTORY)?;
    let proxy: Object<'js> = factory.call((target, handler))?;

    define_value(
        ctx,
        reflect,
        real_global,
        "globalThis",
        proxy.clone().into_value(),
        true,
    )?;

    let scope = Object::new(ctx.clone())?;
    define_value(
        ctx,
        reflect,
        &scope,
        "global",
        proxy.clone().into_value(),
        false,
    )?;
    define_value(
        ctx,
        reflect,
        &scope,
        "source",
        source_function(ctx, token)?.into_value(),
        false,
    )?;
    define_value(
        ctx,
        reflect,
        real_global,
        SCOPE_BINDING,
        scope.into_value(),
        false,
    )?;

    Ok(proxy)
}

/// Define a non-enumerable data property through `Reflect.defineProperty`
fn define_value<'js>(
    ctx: &Ctx<'js>,
    reflect: &Reflect<'js>,
    object: &Object<'js>,
    name: &str,
    value: Value<'js>,
    mutable: bool,
) -> rquickjs::Result<()> {
    let descriptor = Object::new(ctx.clone())?;
    descriptor.set("value", value)?;
    descriptor.set("writable", mutable)?;
    descriptor.set("configurable", mutable)?;
    descriptor.set("enumerable", false)?;

    let key = rquickjs::String::from_str(ctx.clone(), name)?.into_value();
    if reflect.define(object, &key, descriptor.into_value())? {
        Ok(())
    } else {
        Err(Exception::throw_type(
            ctx,
            &format!("cannot define '{}' on the isolated global", name),
        ))
    }
}

/// Native function that hands the pending source to the runner wrapper
fn source_function<'js>(
    ctx: &Ctx<'js>,
    token: &Weak<InterceptorBinding>,
) -> rquickjs::Result<Function<'js>> {
    let token = token.clone();
    Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<String> {
        let binding = upgrade(&ctx, &token)?;
        binding
            .take_source()
            .ok_or_else(|| Exception::throw_type(&ctx, "no source is pending for this context"))
    })
}

/// Restore the stores for a trap
fn enter_trap<'js>(
    ctx: &Ctx<'js>,
    token: &Weak<InterceptorBinding>,
) -> rquickjs::Result<(Rc<InterceptorBinding>, TrapStores<'js>)> {
    let binding = upgrade(ctx, token)?;
    let stores = binding.stores(ctx)?;
    Ok((binding, stores))
}

/// Proxy handler whose traps forward to the interceptor
fn build_handler<'js>(
    ctx: &Ctx<'js>,
    token: &Weak<InterceptorBinding>,
) -> rquickjs::Result<Object<'js>> {
    let handler = Object::new(ctx.clone())?;

    let t = token.clone();
    handler.set(
        "has",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, _target: Value<'js>, key: Value<'js>| -> rquickjs::Result<bool> {
                let (binding, stores) = enter_trap(&ctx, &t)?;
                tracing::trace!(trap = "has", "Intercepted property query");
                if is_scope_binding(&key) {
                    return stores.global.contains(&key);
                }
                // The wrapper's own `eval` must skip the sandbox and resolve to
                // the realm's intrinsic, or it would not be a direct eval
                if binding.phase() == RunPhase::Armed && is_named(&key, "eval") {
                    return Ok(false);
                }
                stores.interceptor().query(&key)
            },
        )?,
    )?;

    let t = token.clone();
    handler.set(
        "get",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  _target: Value<'js>,
                  key: Value<'js>|
                  -> rquickjs::Result<Value<'js>> {
                let (_, stores) = enter_trap(&ctx, &t)?;
                tracing::trace!(trap = "get", "Intercepted property read");
                let found = if is_scope_binding(&key) {
                    if stores.global.contains(&key)? {
                        Some(stores.global.read(&key)?)
                    } else {
                        None
                    }
                } else {
                    stores.interceptor().get(&key)?.into_value()
                };
                Ok(found.unwrap_or_else(|| Value::new_undefined(ctx.clone())))
            },
        )?,
    )?;

    let t = token.clone();
    handler.set(
        "set",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  _target: Value<'js>,
                  key: Value<'js>,
                  value: Value<'js>|
                  -> rquickjs::Result<bool> {
                let (_, stores) = enter_trap(&ctx, &t)?;
                tracing::trace!(trap = "set", "Intercepted property write");
                stores.interceptor().set(&key, value)?;
                Ok(true)
            },
        )?,
    )?;

    let t = token.clone();
    handler.set(
        "deleteProperty",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, _target: Value<'js>, key: Value<'js>| -> rquickjs::Result<bool> {
                let (_, stores) = enter_trap(&ctx, &t)?;
                tracing::trace!(trap = "deleteProperty", "Intercepted property delete");
                stores.interceptor().delete(&key)
            },
        )?,
    )?;

    let t = token.clone();
    handler.set(
        "ownKeys",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, _target: Value<'js>| -> rquickjs::Result<Vec<Value<'js>>> {
                let (_, stores) = enter_trap(&ctx, &t)?;
                tracing::trace!(trap = "ownKeys", "Intercepted enumeration");
                stores.interceptor().enumerate()
            },
        )?,
    )?;

    let t = token.clone();
    handler.set(
        "getOwnPropertyDescriptor",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  _target: Value<'js>,
                  key: Value<'js>|
                  -> rquickjs::Result<Value<'js>> {
                let (_, stores) = enter_trap(&ctx, &t)?;
                let mut descriptor = Value::new_undefined(ctx.clone());
                if !is_scope_binding(&key) {
                    descriptor = stores
                        .sandbox
                        .reflect()
                        .own_descriptor(stores.sandbox.object(), &key)?;
                }
                if descriptor.is_undefined() {
                    descriptor = stores
                        .global
                        .reflect()
                        .own_descriptor(stores.global.object(), &key)?;
                }
                // The target is empty, so only configurable properties can be
                // reported without breaking proxy invariants.
                if let Some(object) = descriptor.as_object() {
                    object.set("configurable", true)?;
                }
                Ok(descriptor)
            },
        )?,
    )?;

    let t = token.clone();
    handler.set(
        "defineProperty",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  _target: Value<'js>,
                  key: Value<'js>,
                  descriptor: Value<'js>|
                  -> rquickjs::Result<bool> {
                let (_, stores) = enter_trap(&ctx, &t)?;
                tracing::trace!(trap = "defineProperty", "Intercepted property definition");
                stores
                    .sandbox
                    .reflect()
                    .define(stores.sandbox.object(), &key, descriptor)
            },
        )?,
    )?;

    Ok(handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_from(engine: &Engine, source: &str) -> Persistent<Value<'static>> {
        engine.with_host(|ctx| {
            let value: Value = ctx.eval(source).unwrap();
            Persistent::save(&ctx, value)
        })
    }

    #[test]
    fn test_rejects_non_object_sandbox() {
        let engine = Engine::with_defaults().unwrap();
        for source in ["42", "'text'", "undefined", "null", "true"] {
            let sandbox = sandbox_from(&engine, source);
            let result = create_context(&engine, &sandbox);
            assert!(
                matches!(result, Err(ContextifyError::Construction { .. })),
                "{} should be rejected",
                source
            );
        }
    }

    #[test]
    fn test_synthetic_global_reflects_sandbox() {
        let engine = Engine::with_defaults().unwrap();
        let sandbox = sandbox_from(&engine, "({ a: 1 })");
        let created = create_context(&engine, &sandbox).unwrap();

        created.isolated.context.with(|ctx| {
            let proxy = created.global_proxy.clone().restore(&ctx).unwrap();
            let a: i32 = proxy.get("a").unwrap();
            assert_eq!(a, 1);

            let keys: Vec<String> = proxy
                .keys::<String>()
                .collect::<rquickjs::Result<_>>()
                .unwrap();
            assert_eq!(keys, vec!["a".to_string()]);

            // globalThis inside the isolated context is the synthetic global
            let is_proxy: bool = ctx.eval("globalThis.a === 1").unwrap();
            assert!(is_proxy);
        });
    }

    #[test]
    fn test_traps_throw_after_binding_dropped() {
        let engine = Engine::with_defaults().unwrap();
        let sandbox = sandbox_from(&engine, "({ a: 1 })");
        let CreatedContext {
            isolated,
            global_proxy,
        } = create_context(&engine, &sandbox).unwrap();
        let IsolatedContext { context, binding } = isolated;
        drop(binding);

        context.with(|ctx| {
            let proxy = global_proxy.clone().restore(&ctx).unwrap();
            let result: rquickjs::Result<i32> = proxy.get("a");
            assert!(result.is_err());
            let exception = ctx.catch();
            let message: String = exception.as_object().unwrap().get("message").unwrap();
            assert!(message.contains("destroyed"), "{}", message);
        });
    }
}
