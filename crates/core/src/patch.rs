//! Structured patches over JSON objects
//!
//! Two patch shapes are accepted:
//!
//! - an **array** of RFC 6902 operations (`add`, `remove`, `replace`,
//!   `move`, `copy`, `test`) addressed by JSON pointers
//! - a **map**, applied as an RFC 7396 merge patch (`null` removes a key)
//!
//! Operation lists are applied all-or-nothing: the target is only replaced
//! once every operation succeeded.

use serde_json::{Map, Value};

use crate::error::{VellumError, VellumResult};

/// Apply `patches` to `target`
///
/// # Errors
///
/// Returns a client error if the patch is neither a map nor an array, or if
/// any operation is malformed or fails (missing path, failed `test`).
pub fn apply_patch(patches: &Value, target: &mut Value) -> VellumResult<()> {
    match patches {
        Value::Array(ops) => {
            let mut working = target.clone();
            for (i, op) in ops.iter().enumerate() {
                apply_operation(op, &mut working).map_err(|e| match e {
                    VellumError::Client { message } => {
                        VellumError::client(format!("Patch operation #{} failed: {}", i, message))
                    }
                    other => other,
                })?;
            }
            *target = working;
            Ok(())
        }
        Value::Object(_) => {
            merge_patch(target, patches);
            Ok(())
        }
        _ => Err(VellumError::client("Patches must be a JSON or MsgPack")),
    }
}

/// RFC 7396 merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Shallow merge: every top-level key of `body` overwrites the one in `target`
///
/// A non-map target is replaced by an empty map first.
pub fn shallow_merge(target: &mut Value, body: &Map<String, Value>) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in body {
            map.insert(key.clone(), value.clone());
        }
    }
}

fn apply_operation(op: &Value, target: &mut Value) -> VellumResult<()> {
    let obj = op
        .as_object()
        .ok_or_else(|| VellumError::client("operation must be an object"))?;
    let name = str_member(obj, "op")?;
    let path = parse_pointer(str_member(obj, "path")?)?;

    match name {
        "add" => add_at(target, &path, value_member(obj)?.clone()),
        "remove" => remove_at(target, &path).map(|_| ()),
        "replace" => {
            let slot = resolve_mut(target, &path)
                .ok_or_else(|| missing(str_member(obj, "path").unwrap_or_default()))?;
            *slot = value_member(obj)?.clone();
            Ok(())
        }
        "move" => {
            let from_str = str_member(obj, "from")?;
            let from = parse_pointer(from_str)?;
            if path.len() > from.len() && path[..from.len()] == from[..] {
                return Err(VellumError::client(format!(
                    "cannot move {:?} into one of its children",
                    from_str
                )));
            }
            let value = remove_at(target, &from)?;
            add_at(target, &path, value)
        }
        "copy" => {
            let from_str = str_member(obj, "from")?;
            let from = parse_pointer(from_str)?;
            let value = resolve(target, &from).cloned().ok_or_else(|| missing(from_str))?;
            add_at(target, &path, value)
        }
        "test" => {
            let expected = value_member(obj)?;
            match resolve(target, &path) {
                Some(actual) if actual == expected => Ok(()),
                _ => Err(VellumError::client(format!(
                    "test failed at {:?}",
                    str_member(obj, "path").unwrap_or_default()
                ))),
            }
        }
        other => Err(VellumError::client(format!("unknown operation {:?}", other))),
    }
}

fn str_member<'a>(obj: &'a Map<String, Value>, key: &str) -> VellumResult<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| VellumError::client(format!("operation requires a string {:?}", key)))
}

fn value_member<'a>(obj: &'a Map<String, Value>) -> VellumResult<&'a Value> {
    obj.get("value")
        .ok_or_else(|| VellumError::client("operation requires a \"value\""))
}

fn missing(path: &str) -> VellumError {
    VellumError::client(format!("path {:?} does not exist", path))
}

/// Split a JSON pointer into unescaped reference tokens
fn parse_pointer(pointer: &str) -> VellumResult<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(VellumError::client(format!(
            "JSON pointer {:?} must start with '/'",
            pointer
        )));
    };
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn parse_index(token: &str, len: usize, allow_end: bool) -> VellumResult<usize> {
    if allow_end && token == "-" {
        return Ok(len);
    }
    let idx: usize = token
        .parse()
        .map_err(|_| VellumError::client(format!("invalid array index {:?}", token)))?;
    let bound = if allow_end { len } else { len.saturating_sub(1) };
    if idx > bound || (!allow_end && len == 0) {
        return Err(VellumError::client(format!("array index {} out of bounds", idx)));
    }
    Ok(idx)
}

fn resolve<'a>(value: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens.iter().try_fold(value, |current, token| match current {
        Value::Object(map) => map.get(token),
        Value::Array(arr) => token.parse::<usize>().ok().and_then(|i| arr.get(i)),
        _ => None,
    })
}

fn resolve_mut<'a>(value: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    let mut current = value;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token)?,
            Value::Array(arr) => arr.get_mut(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn add_at(target: &mut Value, path: &[String], value: Value) -> VellumResult<()> {
    let Some((last, parent_path)) = path.split_last() else {
        *target = value;
        return Ok(());
    };
    let parent = resolve_mut(target, parent_path)
        .ok_or_else(|| VellumError::client("parent of target path does not exist"))?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx = parse_index(last, arr.len(), true)?;
            arr.insert(idx, value);
            Ok(())
        }
        _ => Err(VellumError::client("parent of target path is not a container")),
    }
}

fn remove_at(target: &mut Value, path: &[String]) -> VellumResult<Value> {
    let Some((last, parent_path)) = path.split_last() else {
        return Err(VellumError::client("cannot remove the document root"));
    };
    let parent = resolve_mut(target, parent_path)
        .ok_or_else(|| VellumError::client("parent of target path does not exist"))?;
    match parent {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| VellumError::client(format!("key {:?} does not exist", last))),
        Value::Array(arr) => {
            let idx = parse_index(last, arr.len(), false)?;
            Ok(arr.remove(idx))
        }
        _ => Err(VellumError::client("parent of target path is not a container")),
    }
}
