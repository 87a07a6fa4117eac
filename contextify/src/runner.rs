//! Script execution inside an isolated context
//!
//! Every run first compiles the source on its own, so syntax errors carry the
//! caller's filename and never reach the engine as a thrown value. It then
//! evaluates the same sloppy-mode wrapper as global code, with `this` bound to
//! the synthetic global:
//!
//! ```text
//! with (__contextify__.global) { eval(__contextify__.source()); }
//! ```
//!
//! The direct `eval` resolves free identifiers through the synthetic global,
//! and the source text reaches it through a native function, so it is never
//! spliced into the wrapper.

use crate::binding::{InterceptorBinding, SCOPE_BINDING};
use crate::engine::{ContextId, Engine};
use crate::error::{CompileError, ContextifyError, ExceptionReport, Result, ThrownException};
use crate::factory::IsolatedContext;
use crate::handle::Handle;
use crate::interceptor::PropertyStore;
use rquickjs::convert::Coerced;
use rquickjs::{qjs, CatchResultExt, CaughtError, Ctx, Exception, Object, Persistent, Value};
use std::ffi::{CStr, CString};

const RUN_WRAPPER: &CStr = c"with (__contextify__.global) { eval(__contextify__.source()); }";
const WRAPPER_FILENAME: &CStr = c"contextify:wrapper";

/// Run `source` in `isolated` and return its completion value
///
/// The context is entered for the whole call, including promise jobs and the
/// global leak sweep, and exited on every path before the result is returned.
pub(crate) fn run_script(
    engine: &Engine,
    id: ContextId,
    isolated: &IsolatedContext,
    source: &str,
    filename: &str,
) -> Result<Handle<Value<'static>>> {
    let _scope = engine.enter(id);
    tracing::debug!(context = %id, filename, "Running script");

    isolated.binding.arm(source);
    let _disarm = scopeguard::guard(isolated.binding.clone(), |binding| binding.disarm());

    let outcome = isolated
        .context
        .with(|ctx| execute(&ctx, engine, &isolated.binding, source, filename));

    if engine.config().drain_pending_jobs {
        engine.drain_pending_jobs();
    }

    let swept = isolated
        .context
        .with(|ctx| sweep_globals(&ctx, &isolated.binding));

    match (outcome, swept) {
        (Ok(value), Ok(count)) => {
            tracing::debug!(context = %id, swept = count, "Script completed");
            Ok(value)
        }
        (Ok(_), Err(error)) => Err(error),
        (Err(error), Err(sweep_error)) => {
            tracing::warn!(
                context = %id,
                "Global sweep failed after script error: {}",
                sweep_error
            );
            Err(error)
        }
        (Err(error), Ok(count)) => {
            tracing::debug!(context = %id, swept = count, "Script failed: {}", error);
            Err(error)
        }
    }
}

fn execute<'js>(
    ctx: &Ctx<'js>,
    engine: &Engine,
    binding: &InterceptorBinding,
    source: &str,
    filename: &str,
) -> Result<Handle<Value<'static>>> {
    if let Err(thrown) = compile_only(ctx, source, filename)?.catch(ctx) {
        let thrown = caught_value(thrown)?;
        return Err(match compile_error(ctx, &thrown, filename) {
            Some(error) => error.into(),
            None => thrown_exception(ctx, engine, thrown, filename).into(),
        });
    }

    reinstate_eval(ctx, binding)
        .catch(ctx)
        .map_err(|caught| ContextifyError::engine(format!("cannot prepare run: {}", caught)))?;
    let scope: Object<'js> = ctx.globals().get(SCOPE_BINDING)?;
    let synthetic_global: Object<'js> = scope.get("global")?;

    match eval_wrapper(ctx, &synthetic_global).catch(ctx) {
        Ok(value) => Ok(Handle::new(engine, Persistent::save(ctx, value))),
        Err(caught) => {
            let thrown = caught_value(caught)?;
            Err(thrown_exception(ctx, engine, thrown, filename).into())
        }
    }
}

fn caught_value(caught: CaughtError<'_>) -> Result<Value<'_>> {
    match caught {
        CaughtError::Exception(exception) => Ok(exception.into_object().into_value()),
        CaughtError::Value(value) => Ok(value),
        CaughtError::Error(error) => Err(error.into()),
    }
}

fn thrown_exception<'js>(
    ctx: &Ctx<'js>,
    engine: &Engine,
    thrown: Value<'js>,
    filename: &str,
) -> ThrownException {
    let report = exception_report(ctx, &thrown, filename);
    ThrownException {
        value: Handle::new(engine, Persistent::save(ctx, thrown)),
        report,
    }
}

/// Parse `source` as a sloppy global script without running it
///
/// The outer result fails only for a filename the engine cannot take; a
/// rejected source leaves its exception pending in the inner result.
fn compile_only<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    filename: &str,
) -> Result<rquickjs::Result<()>> {
    let filename = CString::new(filename)
        .map_err(|_| ContextifyError::engine("filename contains a NUL byte"))?;
    // QuickJS reads up to the given length but expects a terminator after it
    let mut input = Vec::with_capacity(source.len() + 1);
    input.extend_from_slice(source.as_bytes());
    input.push(0);

    let flags = (qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_COMPILE_ONLY) as i32;
    // SAFETY: `ctx` is a live context and both buffers are NUL-terminated and
    // outlive the call. A non-exception result is an owned compiled function,
    // released when the `Value` drops.
    unsafe {
        let raw = qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            input.as_ptr().cast(),
            source.len() as _,
            filename.as_ptr(),
            flags,
        );
        if qjs::JS_VALUE_GET_NORM_TAG(raw) == qjs::JS_TAG_EXCEPTION {
            return Ok(Err(rquickjs::Error::Exception));
        }
        drop(Value::from_raw(ctx.clone(), raw));
    }
    Ok(Ok(()))
}

/// Evaluate the wrapper as sloppy global code whose `this` is `this`
fn eval_wrapper<'js>(ctx: &Ctx<'js>, this: &Object<'js>) -> rquickjs::Result<Value<'js>> {
    // SAFETY: `ctx` is a live context. QuickJS borrows `this` for the call
    // without taking a reference. A non-exception result is owned and handed
    // to `Value`.
    unsafe {
        let raw = qjs::JS_EvalThis(
            ctx.as_raw().as_ptr(),
            this.as_raw(),
            RUN_WRAPPER.as_ptr(),
            RUN_WRAPPER.to_bytes().len() as _,
            WRAPPER_FILENAME.as_ptr(),
            qjs::JS_EVAL_TYPE_GLOBAL as i32,
        );
        if qjs::JS_VALUE_GET_NORM_TAG(raw) == qjs::JS_TAG_EXCEPTION {
            return Err(rquickjs::Error::Exception);
        }
        Ok(Value::from_raw(ctx.clone(), raw))
    }
}

/// Put the realm's own `eval` back on the isolated real global
///
/// The wrapper's call is only a direct eval while the real global's `eval` is
/// the intrinsic, which code running outside the `with` scope can replace or
/// delete.
fn reinstate_eval<'js>(ctx: &Ctx<'js>, binding: &InterceptorBinding) -> rquickjs::Result<()> {
    let stores = binding.stores(ctx)?;
    let reflect = stores.global.reflect();
    let key = rquickjs::String::from_str(ctx.clone(), "eval")?.into_value();
    let intrinsic = reflect.intrinsic_eval().clone().into_value();

    let current = reflect.own_descriptor(stores.global.object(), &key)?;
    if let Some(current) = current.as_object() {
        if current.get::<_, Value<'js>>("value")? == intrinsic {
            return Ok(());
        }
    }

    let descriptor = Object::new(ctx.clone())?;
    descriptor.set("value", intrinsic)?;
    descriptor.set("writable", true)?;
    descriptor.set("enumerable", false)?;
    descriptor.set("configurable", true)?;
    if !reflect.define(stores.global.object(), &key, descriptor.into_value())? {
        return Err(Exception::throw_type(
            ctx,
            "eval on the isolated global can no longer be restored",
        ));
    }
    tracing::debug!("Reinstated eval on the isolated global");
    Ok(())
}

fn compile_error<'js>(
    ctx: &Ctx<'js>,
    thrown: &Value<'js>,
    filename: &str,
) -> Option<CompileError> {
    let object = thrown.as_object()?;
    if read_string(ctx, object, "name").as_deref() != Some("SyntaxError") {
        return None;
    }
    Some(CompileError {
        message: read_string(ctx, object, "message").unwrap_or_default(),
        filename: filename.to_string(),
        line: read_position(ctx, object, "lineNumber"),
        column: read_position(ctx, object, "columnNumber"),
    })
}

fn exception_report<'js>(
    ctx: &Ctx<'js>,
    thrown: &Value<'js>,
    filename: &str,
) -> ExceptionReport {
    match thrown.as_object() {
        Some(object) => ExceptionReport {
            name: read_string(ctx, object, "name"),
            message: read_string(ctx, object, "message")
                .unwrap_or_else(|| coerce_string(ctx, thrown)),
            stack: read_string(ctx, object, "stack"),
            filename: filename.to_string(),
        },
        None => ExceptionReport {
            name: None,
            message: coerce_string(ctx, thrown),
            stack: None,
            filename: filename.to_string(),
        },
    }
}

/// Read `key` as a string, treating absence and failing getters alike
fn read_string<'js>(ctx: &Ctx<'js>, object: &Object<'js>, key: &str) -> Option<String> {
    match object.get::<_, Option<Coerced<String>>>(key) {
        Ok(value) => value.map(|Coerced(s)| s),
        Err(_) => {
            let _ = ctx.catch();
            None
        }
    }
}

fn read_position<'js>(ctx: &Ctx<'js>, object: &Object<'js>, key: &str) -> Option<u32> {
    match object.get::<_, Option<i32>>(key) {
        Ok(value) => value.and_then(|n| u32::try_from(n).ok()).filter(|n| *n > 0),
        Err(_) => {
            let _ = ctx.catch();
            None
        }
    }
}

fn coerce_string<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    match value.get::<Coerced<String>>() {
        Ok(Coerced(s)) => s,
        Err(_) => {
            let _ = ctx.catch();
            format!("<{}>", value.type_name())
        }
    }
}

/// Move properties that leaked onto the isolated real global into the sandbox
///
/// Returns how many properties were moved.
fn sweep_globals<'js>(ctx: &Ctx<'js>, binding: &InterceptorBinding) -> Result<usize> {
    match sweep(ctx, binding).catch(ctx) {
        Ok(count) => Ok(count),
        Err(CaughtError::Error(error)) => Err(error.into()),
        Err(caught) => Err(ContextifyError::engine(format!(
            "global sweep failed: {}",
            caught
        ))),
    }
}

fn sweep<'js>(ctx: &Ctx<'js>, binding: &InterceptorBinding) -> rquickjs::Result<usize> {
    let stores = binding.stores(ctx)?;
    let mut count = 0;

    for key in stores.global.own_keys()? {
        let Some(name) = key.as_string() else {
            continue;
        };
        let name = name.to_string()?;
        if binding.in_baseline(&name) || binding.is_pinned(&name) {
            continue;
        }

        let value = stores.global.read(&key)?;
        // A hoisted `var` without initializer must not clobber a sandbox value
        if !value.is_undefined() || !stores.sandbox.contains_own(&key)? {
            stores.sandbox.write(&key, value)?;
        }
        if stores.global.remove(&key)? {
            tracing::debug!(key = %name, "Swept leaked global into sandbox");
        } else {
            // Copied once; later writes go to the sandbox, which shadows it
            binding.pin(&name);
            tracing::warn!(
                key = %name,
                "Leaked global cannot be removed from the isolated global"
            );
        }
        count += 1;
    }

    Ok(count)
}
