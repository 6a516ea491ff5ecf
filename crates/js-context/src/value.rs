//! Conversion between host values (`serde_json::Value`) and engine values.
//!
//! Host to engine is total. Engine to host follows `JSON.stringify` closely:
//! non-data values (functions, symbols, pending promises) become `null`, and
//! object members holding them are skipped. Cycles and pathological nesting
//! fail with a conversion error instead of recursing forever.

use rquickjs::object::Property;
use rquickjs::{Array, Coerced, Ctx, Object, Value};
use serde_json::{Map, Number, Value as JsonValue};

use crate::error::{ContextError, JsException, Result};

/// Nesting depth beyond which a structure is rejected.
pub const MAX_DEPTH: usize = 128;

/// Convert an engine value into a host value.
pub(crate) fn to_host(value: &Value<'_>) -> Result<JsonValue> {
    let mut ancestors = Vec::new();
    convert(value, 0, &mut ancestors)
}

fn convert<'js>(
    value: &Value<'js>,
    depth: usize,
    ancestors: &mut Vec<Value<'js>>,
) -> Result<JsonValue> {
    if depth > MAX_DEPTH {
        return Err(ContextError::conversion(format!(
            "value is nested deeper than {MAX_DEPTH} levels"
        )));
    }

    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(JsonValue::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(JsonValue::from(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(number_from_f64(f));
    }
    if let Some(s) = value.as_string() {
        let text = s.to_string().map_err(|e| {
            ContextError::conversion(format!("string is not valid unicode: {e}"))
        })?;
        return Ok(JsonValue::String(text));
    }
    if value.is_big_int() {
        let digits = value.get::<Coerced<String>>()?.0;
        return Ok(digits
            .parse::<i64>()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::String(digits)));
    }
    if is_opaque(value) {
        return Ok(JsonValue::Null);
    }

    if ancestors.iter().any(|seen| seen == value) {
        return Err(ContextError::conversion(
            "cyclic structure cannot be converted",
        ));
    }

    ancestors.push(value.clone());
    let converted = if let Some(array) = value.as_array() {
        convert_array(array, depth, ancestors)
    } else if let Some(exception) = value.as_exception() {
        let mut map = Map::new();
        let name: Option<String> = exception.get("name").unwrap_or(None);
        map.insert(
            "name".to_string(),
            JsonValue::String(name.unwrap_or_else(|| "Error".to_string())),
        );
        map.insert(
            "message".to_string(),
            JsonValue::String(exception.message().unwrap_or_default()),
        );
        if let Some(stack) = exception.stack().filter(|s| !s.is_empty()) {
            map.insert("stack".to_string(), JsonValue::String(stack));
        }
        Ok(JsonValue::Object(map))
    } else if let Some(object) = value.as_object() {
        convert_object(object, depth, ancestors)
    } else {
        Ok(JsonValue::Null)
    };
    ancestors.pop();
    converted
}

fn convert_array<'js>(
    array: &Array<'js>,
    depth: usize,
    ancestors: &mut Vec<Value<'js>>,
) -> Result<JsonValue> {
    let mut items = Vec::with_capacity(array.len());
    for item in array.iter::<Value>() {
        items.push(convert(&item?, depth + 1, ancestors)?);
    }
    Ok(JsonValue::Array(items))
}

fn convert_object<'js>(
    object: &Object<'js>,
    depth: usize,
    ancestors: &mut Vec<Value<'js>>,
) -> Result<JsonValue> {
    let mut map = Map::new();
    for prop in object.props::<String, Value>() {
        let (key, member) = prop?;
        if is_opaque(&member) || member.is_undefined() {
            continue;
        }
        map.insert(key, convert(&member, depth + 1, ancestors)?);
    }
    Ok(JsonValue::Object(map))
}

fn is_opaque(value: &Value<'_>) -> bool {
    value.is_function() || value.is_constructor() || value.is_symbol() || value.is_promise()
}

fn number_from_f64(f: f64) -> JsonValue {
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
    if f.is_finite() && f.fract() == 0.0 && f >= -I64_BOUND && f < I64_BOUND {
        return JsonValue::from(f as i64);
    }
    Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Convert a host value into an engine value.
pub(crate) fn to_js<'js>(ctx: &Ctx<'js>, value: &JsonValue) -> Result<Value<'js>> {
    Ok(match value {
        JsonValue::Null => Value::new_null(ctx.clone()),
        JsonValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
        JsonValue::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => Value::new_int(ctx.clone(), i),
            None => Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
        JsonValue::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, to_js(ctx, item)?)?;
            }
            array.into_value()
        }
        JsonValue::Object(map) => {
            let object = Object::new(ctx.clone())?;
            // Defined rather than assigned, so `__proto__` stays an own key.
            for (key, item) in map {
                let item = Property::from(to_js(ctx, item)?)
                    .writable()
                    .enumerable()
                    .configurable();
                object.prop(key.as_str(), item)?;
            }
            object.into_value()
        }
    })
}

/// Describe a thrown value. Never fails: unreadable parts fall back to
/// placeholders so an exception is never lost on its way out of the engine.
pub(crate) fn exception_from_value(value: &Value<'_>) -> JsException {
    if let Some(exception) = value.as_exception() {
        let name: Option<String> = exception.get("name").unwrap_or(None);
        let name = name.unwrap_or_else(|| "Error".to_string());
        let message = exception.message().unwrap_or_default();
        let stack = exception.stack().filter(|s| !s.is_empty());
        let value = to_host(value)
            .unwrap_or_else(|_| serde_json::json!({ "name": name, "message": message }));
        return JsException {
            name,
            message,
            stack,
            value,
        };
    }

    let converted = to_host(value).unwrap_or(JsonValue::Null);
    let message = match &converted {
        JsonValue::String(s) => s.clone(),
        JsonValue::Object(_) | JsonValue::Array(_) => converted.to_string(),
        _ => value
            .get::<Coerced<String>>()
            .map(|s| s.0)
            .unwrap_or_else(|_| converted.to_string()),
    };
    JsException {
        name: String::new(),
        message,
        stack: None,
        value: converted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_ctx<R>(f: impl for<'js> FnOnce(Ctx<'js>) -> R) -> R {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(f)
    }

    fn eval_host(source: &str) -> Result<JsonValue> {
        with_ctx(|ctx| {
            let value: Value = ctx.eval(source).unwrap();
            to_host(&value)
        })
    }

    #[test]
    fn test_scalars() {
        assert_eq!(eval_host("1 + 2").unwrap(), json!(3));
        assert_eq!(eval_host("0.5").unwrap(), json!(0.5));
        assert_eq!(eval_host("2 ** 40").unwrap(), json!(1_099_511_627_776_i64));
        assert_eq!(eval_host("'hi'").unwrap(), json!("hi"));
        assert_eq!(eval_host("true").unwrap(), json!(true));
        assert_eq!(eval_host("undefined").unwrap(), JsonValue::Null);
        assert_eq!(eval_host("NaN").unwrap(), JsonValue::Null);
        assert_eq!(eval_host("12n").unwrap(), json!(12));
        assert_eq!(
            eval_host("2n ** 80n").unwrap(),
            json!("1208925819614629174706176")
        );
    }

    #[test]
    fn test_structures_keep_key_order() {
        let value = eval_host("({ z: 1, a: [1, 'two', { b: null }], m: undefined })").unwrap();
        assert_eq!(value, json!({ "z": 1, "a": [1, "two", { "b": null }] }));
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_functions_are_opaque() {
        assert_eq!(eval_host("(function f() {})").unwrap(), JsonValue::Null);
        assert_eq!(
            eval_host("({ f() {}, n: 1, s: Symbol('x') })").unwrap(),
            json!({ "n": 1 })
        );
        assert_eq!(eval_host("[() => 1]").unwrap(), json!([null]));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = eval_host("const o = {}; o.self = o; o").unwrap_err();
        assert!(matches!(err, ContextError::Conversion(_)));
    }

    #[test]
    fn test_shared_reference_is_not_a_cycle() {
        let value = eval_host("const s = { v: 1 }; ({ a: s, b: s })").unwrap();
        assert_eq!(value, json!({ "a": { "v": 1 }, "b": { "v": 1 } }));
    }

    #[test]
    fn test_host_to_js_roundtrip() {
        let input = json!({ "n": 7, "big": 10_000_000_000_i64, "f": 1.5, "list": ["a", true, null] });
        let output = with_ctx(|ctx| {
            let value = to_js(&ctx, &input).unwrap();
            to_host(&value).unwrap()
        });
        assert_eq!(output, input);
    }

    #[test]
    fn test_proto_key_stays_an_own_property() {
        let input = json!({ "__proto__": { "a": 1 }, "b": 2 });
        let (output, inherited) = with_ctx(|ctx| {
            let value = to_js(&ctx, &input).unwrap();
            let object = value.as_object().unwrap();
            let inherited: Option<i32> = object.get("a").unwrap();
            (to_host(&value).unwrap(), inherited)
        });
        assert_eq!(output, input);
        assert_eq!(inherited, None);
    }

    #[test]
    fn test_lone_surrogate_is_conversion_error() {
        let err = eval_host("'\\uD800'").unwrap_err();
        assert!(matches!(err, ContextError::Conversion(_)), "got {err}");
        assert_eq!(eval_host("'\\uD83D\\uDE00'").unwrap(), json!("\u{1F600}"));
    }

    #[test]
    fn test_exception_description() {
        with_ctx(|ctx| {
            let err: Value = ctx.eval("new TypeError('bad thing')").unwrap();
            let exc = exception_from_value(&err);
            assert_eq!(exc.name, "TypeError");
            assert_eq!(exc.message, "bad thing");
            assert_eq!(exc.value["message"], json!("bad thing"));

            let thrown: Value = ctx.eval("42").unwrap();
            let exc = exception_from_value(&thrown);
            assert_eq!(exc.name, "");
            assert_eq!(exc.message, "42");
            assert_eq!(exc.value, json!(42));
        });
    }
}
