//! Scripted side-effect hooks
//!
//! A hook sees every write of its content type before the schema transform:
//! the request verb, the incoming object, the currently stored object, and
//! the parameters it was registered with. It returns the object to index.
//!
//! Content types without a registered hook resolve to [`NoopHook`], which
//! returns the incoming object untouched.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use vellum_core::{Method, VellumResult};

/// Content type of writes that carry only an object
pub const OBJECT_CONTENT_TYPE: &str = "application/json";

/// A side-effect hook
pub trait ScriptHook: Send + Sync {
    /// Transform `new_obj` given the stored `old_obj`
    fn run(&self, method: Method, new_obj: Value, old_obj: &Value, params: &Value)
        -> VellumResult<Value>;

    /// True for the hook that does nothing
    ///
    /// The handler skips the read of the stored object for no-op hooks.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Hook used when none is registered
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl ScriptHook for NoopHook {
    fn run(&self, _: Method, new_obj: Value, _: &Value, _: &Value) -> VellumResult<Value> {
        Ok(new_obj)
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// A hook bound to its parameters
#[derive(Clone)]
pub struct Script {
    hook: Arc<dyn ScriptHook>,
    params: Value,
}

impl Script {
    /// Bind `hook` to `params`
    pub fn new(hook: Arc<dyn ScriptHook>, params: Value) -> Self {
        Script { hook, params }
    }

    /// The no-op script
    pub fn noop() -> Self {
        Script::new(Arc::new(NoopHook), Value::Null)
    }

    /// True if running this script cannot change anything
    pub fn is_noop(&self) -> bool {
        self.hook.is_noop()
    }

    /// Run the hook
    pub fn run(&self, method: Method, new_obj: Value, old_obj: &Value) -> VellumResult<Value> {
        self.hook.run(method, new_obj, old_obj, &self.params)
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("noop", &self.is_noop())
            .field("params", &self.params)
            .finish()
    }
}

/// Hooks by content type
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: DashMap<String, Script>,
}

impl ScriptRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` with `params` for writes of `content_type`
    pub fn register(&self, content_type: &str, hook: Arc<dyn ScriptHook>, params: Value) {
        self.scripts
            .insert(content_type.to_string(), Script::new(hook, params));
    }

    /// Remove the hook of `content_type`; true if there was one
    pub fn unregister(&self, content_type: &str) -> bool {
        self.scripts.remove(content_type).is_some()
    }

    /// Script for `content_type`, the no-op script if none is registered
    pub fn script_for(&self, content_type: &str) -> Script {
        self.scripts
            .get(content_type)
            .map(|s| s.value().clone())
            .unwrap_or_else(Script::noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Stamp;

    impl ScriptHook for Stamp {
        fn run(&self, method: Method, mut new_obj: Value, old_obj: &Value, params: &Value)
            -> VellumResult<Value> {
            new_obj["method"] = json!(method.as_str());
            new_obj["previous"] = old_obj.get("n").cloned().unwrap_or(Value::Null);
            new_obj["tag"] = params["tag"].clone();
            Ok(new_obj)
        }
    }

    #[test]
    fn missing_hook_is_noop() {
        let registry = ScriptRegistry::new();
        let script = registry.script_for(OBJECT_CONTENT_TYPE);
        assert!(script.is_noop());
        let obj = json!({"a": 1});
        assert_eq!(script.run(Method::Put, obj.clone(), &json!({})).unwrap(), obj);
    }

    #[test]
    fn registered_hook_sees_old_object_and_params() {
        let registry = ScriptRegistry::new();
        registry.register(OBJECT_CONTENT_TYPE, Arc::new(Stamp), json!({"tag": "x"}));

        let script = registry.script_for(OBJECT_CONTENT_TYPE);
        assert!(!script.is_noop());
        let out = script
            .run(Method::Patch, json!({"n": 2}), &json!({"n": 1}))
            .unwrap();
        assert_eq!(out, json!({"n": 2, "method": "PATCH", "previous": 1, "tag": "x"}));

        assert!(registry.unregister(OBJECT_CONTENT_TYPE));
        assert!(registry.script_for(OBJECT_CONTENT_TYPE).is_noop());
    }
}
