//! Property interception for the synthetic global object
//!
//! [`Interceptor`] maps one property operation onto a pair of stores: the
//! sandbox object and the real global object. It holds nothing but the two
//! references, so the same logic serves every trap invocation, including
//! re-entrant ones triggered by getters that call back into script code.
//!
//! Precedence rules:
//!
//! - **get / query**: the sandbox first, then the real global. A key present
//!   on neither is reported as absent, never as an `undefined` value.
//! - **set**: always the sandbox.
//! - **delete**: the sandbox if it owns the key, otherwise the real global.
//! - **enumerate**: the sandbox's own keys only.

/// Primitive object operations the interceptor needs from an engine
///
/// `contains` is an existence check: it may walk the prototype chain but must
/// not run getters. `read` is only called after `contains` returned true.
pub trait PropertyStore {
    /// Property key type
    type Key;
    /// Property value type
    type Value: Clone;
    /// Engine error type
    type Error;

    /// Whether `key` exists on the object or its prototype chain
    fn contains(&self, key: &Self::Key) -> Result<bool, Self::Error>;

    /// Whether `key` is an own property of the object
    fn contains_own(&self, key: &Self::Key) -> Result<bool, Self::Error>;

    /// Read `key`
    fn read(&self, key: &Self::Key) -> Result<Self::Value, Self::Error>;

    /// Write `key`; returns whether the engine accepted the write
    fn write(&self, key: &Self::Key, value: Self::Value) -> Result<bool, Self::Error>;

    /// Delete own `key`; returns whether the engine reported success
    fn remove(&self, key: &Self::Key) -> Result<bool, Self::Error>;

    /// Own property keys in engine order
    fn own_keys(&self) -> Result<Vec<Self::Key>, Self::Error>;
}

/// Which object a lookup was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The sandbox object
    Sandbox,
    /// The real global object
    Global,
}

/// Result of an intercepted read
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    /// The key was found
    Found {
        /// Value read
        value: V,
        /// Object that supplied it
        source: Source,
    },
    /// The key exists on neither object
    NotFound,
}

impl<V> Lookup<V> {
    /// The value, if one was found
    pub fn into_value(self) -> Option<V> {
        match self {
            Lookup::Found { value, .. } => Some(value),
            Lookup::NotFound => None,
        }
    }

    /// Whether the key was found
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found { .. })
    }
}

/// Routes property operations between a sandbox and the real global
pub struct Interceptor<'a, S> {
    sandbox: &'a S,
    global: &'a S,
}

impl<'a, S> Interceptor<'a, S>
where
    S: PropertyStore,
{
    /// Bind an interceptor to a sandbox and the real global
    pub fn new(sandbox: &'a S, global: &'a S) -> Self {
        Self { sandbox, global }
    }

    /// Read `key`, letting the sandbox shadow the real global
    pub fn get(&self, key: &S::Key) -> Result<Lookup<S::Value>, S::Error> {
        if self.sandbox.contains(key)? {
            return Ok(Lookup::Found {
                value: self.sandbox.read(key)?,
                source: Source::Sandbox,
            });
        }
        if self.global.contains(key)? {
            return Ok(Lookup::Found {
                value: self.global.read(key)?,
                source: Source::Global,
            });
        }
        Ok(Lookup::NotFound)
    }

    /// Write `key` into the sandbox and return the assigned value
    ///
    /// The assignment always reports success, whatever the sandbox did with it.
    pub fn set(&self, key: &S::Key, value: S::Value) -> Result<S::Value, S::Error> {
        self.sandbox.write(key, value.clone())?;
        Ok(value)
    }

    /// Whether `key` exists on either object
    pub fn query(&self, key: &S::Key) -> Result<bool, S::Error> {
        Ok(self.sandbox.contains(key)? || self.global.contains(key)?)
    }

    /// Delete `key` from the sandbox, falling back to the real global
    pub fn delete(&self, key: &S::Key) -> Result<bool, S::Error> {
        if self.sandbox.contains_own(key)? && self.sandbox.remove(key)? {
            return Ok(true);
        }
        self.global.remove(key)
    }

    /// Own keys of the sandbox; real-global built-ins are never listed
    pub fn enumerate(&self) -> Result<Vec<S::Key>, S::Error> {
        self.sandbox.own_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, BTreeSet};
    use std::convert::Infallible;

    /// Ordered in-memory object with optional prototype and sealed keys
    #[derive(Default)]
    struct MemoryObject {
        own: RefCell<BTreeMap<String, i64>>,
        proto: BTreeMap<String, i64>,
        sealed: BTreeSet<String>,
    }

    impl MemoryObject {
        fn with(entries: &[(&str, i64)]) -> Self {
            let object = Self::default();
            for (k, v) in entries {
                object.own.borrow_mut().insert(k.to_string(), *v);
            }
            object
        }

        fn own_value(&self, key: &str) -> Option<i64> {
            self.own.borrow().get(key).copied()
        }
    }

    impl PropertyStore for MemoryObject {
        type Key = String;
        type Value = i64;
        type Error = Infallible;

        fn contains(&self, key: &String) -> Result<bool, Infallible> {
            Ok(self.own.borrow().contains_key(key) || self.proto.contains_key(key))
        }

        fn contains_own(&self, key: &String) -> Result<bool, Infallible> {
            Ok(self.own.borrow().contains_key(key))
        }

        fn read(&self, key: &String) -> Result<i64, Infallible> {
            Ok(self
                .own
                .borrow()
                .get(key)
                .or_else(|| self.proto.get(key))
                .copied()
                .unwrap_or_default())
        }

        fn write(&self, key: &String, value: i64) -> Result<bool, Infallible> {
            if self.sealed.contains(key) {
                return Ok(false);
            }
            self.own.borrow_mut().insert(key.clone(), value);
            Ok(true)
        }

        fn remove(&self, key: &String) -> Result<bool, Infallible> {
            if self.sealed.contains(key) {
                return Ok(false);
            }
            self.own.borrow_mut().remove(key);
            Ok(true)
        }

        fn own_keys(&self) -> Result<Vec<String>, Infallible> {
            Ok(self.own.borrow().keys().cloned().collect())
        }
    }

    fn key(k: &str) -> String {
        k.to_string()
    }

    #[test]
    fn test_get_prefers_sandbox() {
        let sandbox = MemoryObject::with(&[("parseInt", 7)]);
        let global = MemoryObject::with(&[("parseInt", 1), ("Math", 2)]);
        let interceptor = Interceptor::new(&sandbox, &global);

        assert_eq!(
            interceptor.get(&key("parseInt")).unwrap(),
            Lookup::Found {
                value: 7,
                source: Source::Sandbox
            }
        );
        assert_eq!(
            interceptor.get(&key("Math")).unwrap(),
            Lookup::Found {
                value: 2,
                source: Source::Global
            }
        );
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let sandbox = MemoryObject::default();
        let global = MemoryObject::default();
        let interceptor = Interceptor::new(&sandbox, &global);

        let lookup = interceptor.get(&key("nothing")).unwrap();
        assert!(!lookup.is_found());
        assert_eq!(lookup.into_value(), None);
    }

    #[test]
    fn test_get_follows_sandbox_prototype() {
        let mut sandbox = MemoryObject::default();
        sandbox.proto.insert(key("inherited"), 5);
        let global = MemoryObject::with(&[("inherited", 9)]);
        let interceptor = Interceptor::new(&sandbox, &global);

        assert_eq!(
            interceptor.get(&key("inherited")).unwrap().into_value(),
            Some(5)
        );
    }

    #[test]
    fn test_set_writes_sandbox_only() {
        let sandbox = MemoryObject::default();
        let global = MemoryObject::with(&[("Math", 2)]);
        let interceptor = Interceptor::new(&sandbox, &global);

        assert_eq!(interceptor.set(&key("x"), 10).unwrap(), 10);
        assert_eq!(interceptor.set(&key("Math"), 3).unwrap(), 3);

        assert_eq!(sandbox.own_value("x"), Some(10));
        assert_eq!(sandbox.own_value("Math"), Some(3));
        assert_eq!(global.own_value("x"), None);
        assert_eq!(global.own_value("Math"), Some(2));
    }

    #[test]
    fn test_set_reports_success_when_sandbox_refuses() {
        let mut sandbox = MemoryObject::default();
        sandbox.sealed.insert(key("frozen"));
        let global = MemoryObject::default();
        let interceptor = Interceptor::new(&sandbox, &global);

        assert_eq!(interceptor.set(&key("frozen"), 4).unwrap(), 4);
        assert_eq!(sandbox.own_value("frozen"), None);
        assert_eq!(global.own_value("frozen"), None);
    }

    #[test]
    fn test_query_checks_both_objects() {
        let sandbox = MemoryObject::with(&[("a", 1)]);
        let global = MemoryObject::with(&[("b", 2)]);
        let interceptor = Interceptor::new(&sandbox, &global);

        assert!(interceptor.query(&key("a")).unwrap());
        assert!(interceptor.query(&key("b")).unwrap());
        assert!(!interceptor.query(&key("c")).unwrap());
    }

    #[test]
    fn test_delete_sandbox_then_fall_through() {
        let sandbox = MemoryObject::with(&[("Math", 3)]);
        let global = MemoryObject::with(&[("Math", 2)]);
        let interceptor = Interceptor::new(&sandbox, &global);

        assert!(interceptor.delete(&key("Math")).unwrap());
        assert_eq!(sandbox.own_value("Math"), None);
        assert_eq!(global.own_value("Math"), Some(2));

        // Shadow gone: the real global answers again
        assert_eq!(
            interceptor.get(&key("Math")).unwrap(),
            Lookup::Found {
                value: 2,
                source: Source::Global
            }
        );
    }

    #[test]
    fn test_delete_absent_from_sandbox_hits_global() {
        let sandbox = MemoryObject::default();
        let global = MemoryObject::with(&[("escape", 1)]);
        let interceptor = Interceptor::new(&sandbox, &global);

        assert!(interceptor.delete(&key("escape")).unwrap());
        assert_eq!(global.own_value("escape"), None);
    }

    #[test]
    fn test_delete_refused_by_sandbox_tries_global() {
        let mut sandbox = MemoryObject::with(&[("locked", 1)]);
        sandbox.sealed.insert(key("locked"));
        let mut global = MemoryObject::with(&[("locked", 2)]);
        global.sealed.insert(key("locked"));
        let interceptor = Interceptor::new(&sandbox, &global);

        assert!(!interceptor.delete(&key("locked")).unwrap());
        assert_eq!(sandbox.own_value("locked"), Some(1));
        assert_eq!(global.own_value("locked"), Some(2));
    }

    #[test]
    fn test_enumerate_lists_sandbox_keys_only() {
        let mut sandbox = MemoryObject::with(&[("b", 2), ("a", 1)]);
        sandbox.proto.insert(key("inherited"), 0);
        let global = MemoryObject::with(&[("Math", 1), ("JSON", 2)]);
        let interceptor = Interceptor::new(&sandbox, &global);

        assert_eq!(interceptor.enumerate().unwrap(), vec![key("a"), key("b")]);
    }
}
