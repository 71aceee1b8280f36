//! Result-variable serialization.
//!
//! Converts a named interpreter value into a bounded, JSON-safe descriptor.
//! Collections are cut at 100 elements, strings at 10 000 characters,
//! fallback reprs at 1 000; tabular frames get a 10-row preview. Failures
//! degrade to an error descriptor and never propagate.

use pyo3::prelude::*;
use pyo3::types::{
    PyBool, PyDate, PyDateTime, PyDict, PyFloat, PyFrozenSet, PyInt, PyList, PySet, PyString,
    PyTuple,
};
use serde_json::{Value, json};

/// Element cap for collections, arrays, and series data.
const MAX_ITEMS: usize = 100;
/// Character cap for string values.
const MAX_STRING_LEN: usize = 10_000;
/// Rows included in a frame preview.
const PREVIEW_ROWS: usize = 10;
/// Row-count ceiling above which per-column unique counts are skipped.
const UNIQUE_COUNT_CEILING: i64 = 100_000;

/// Serialize an interpreter value into its JSON descriptor.
pub fn serialize_variable(value: &Bound<'_, PyAny>, name: &str) -> Value {
    match try_serialize(value, name) {
        Ok(descriptor) => descriptor,
        Err(e) => json!({
            "name": name,
            "type": type_name(value),
            "error": format!("serialization failed: {e}"),
            "repr": safe_repr(value, 500),
        }),
    }
}

fn try_serialize(value: &Bound<'_, PyAny>, name: &str) -> PyResult<Value> {
    let py = value.py();

    if value.is_none() {
        return Ok(json!({ "name": name, "type": "NoneType", "value": null }));
    }

    // Pandas types first; their instances would otherwise fall through to
    // the generic repr branch.
    if let Ok(pandas) = py.import("pandas") {
        if value.is_instance(&pandas.getattr("DataFrame")?)? {
            return serialize_dataframe(value, name, &pandas);
        }
        if value.is_instance(&pandas.getattr("Series")?)? {
            return serialize_series(value, name);
        }
    }

    // bool is a subclass of int; check it first.
    if value.is_instance_of::<PyBool>() {
        return Ok(json!({ "name": name, "type": "bool", "value": value.extract::<bool>()? }));
    }

    if value.is_instance_of::<PyInt>() {
        return Ok(match value.extract::<i64>() {
            Ok(v) => json!({ "name": name, "type": "int", "value": v }),
            // Out of i64 range; report the digits instead
            Err(_) => json!({ "name": name, "type": "int", "value": value.str()?.to_string() }),
        });
    }

    if value.is_instance_of::<PyFloat>() {
        let v = value.extract::<f64>()?;
        let json_value = if v.is_nan() { Value::Null } else { json!(v) };
        return Ok(json!({ "name": name, "type": "float", "value": json_value }));
    }

    if value.is_instance_of::<PyString>() {
        let s = value.extract::<String>()?;
        let char_count = s.chars().count();
        let truncated = char_count > MAX_STRING_LEN;
        let shown: String = s.chars().take(MAX_STRING_LEN).collect();
        return Ok(json!({
            "name": name,
            "type": "str",
            "value": shown,
            "truncated": truncated,
            "original_length": char_count,
        }));
    }

    // datetime is a subclass of date; check it first.
    if value.is_instance_of::<PyDateTime>() {
        let iso: String = value.call_method0("isoformat")?.extract()?;
        return Ok(json!({ "name": name, "type": "datetime", "value": iso }));
    }

    if value.is_instance_of::<PyDate>() {
        let iso: String = value.call_method0("isoformat")?.extract()?;
        return Ok(json!({ "name": name, "type": "date", "value": iso }));
    }

    if let Ok(list) = value.downcast::<PyList>() {
        let data: Vec<Value> = list
            .iter()
            .take(MAX_ITEMS)
            .map(|item| element_to_json(&item))
            .collect();
        return Ok(json!({
            "name": name,
            "type": "list",
            "length": list.len(),
            "data": data,
            "truncated": list.len() > MAX_ITEMS,
        }));
    }

    if let Ok(tuple) = value.downcast::<PyTuple>() {
        let data: Vec<Value> = tuple
            .iter()
            .take(MAX_ITEMS)
            .map(|item| element_to_json(&item))
            .collect();
        return Ok(json!({
            "name": name,
            "type": "tuple",
            "length": tuple.len(),
            "data": data,
            "truncated": tuple.len() > MAX_ITEMS,
        }));
    }

    if let Ok(dict) = value.downcast::<PyDict>() {
        let mut keys = Vec::new();
        let mut data = serde_json::Map::new();
        for (key, val) in dict.iter().take(MAX_ITEMS) {
            let key_str = key
                .str()
                .map(|k| k.to_string())
                .unwrap_or_else(|_| format!("<key_{}>", keys.len()));
            keys.push(key_str.clone());
            data.insert(key_str, element_to_json(&val));
        }
        return Ok(json!({
            "name": name,
            "type": "dict",
            "length": dict.len(),
            "keys": keys,
            "data": data,
            "truncated": dict.len() > MAX_ITEMS,
        }));
    }

    if let Ok(set) = value.downcast::<PySet>() {
        let data: Vec<Value> = set
            .iter()
            .take(MAX_ITEMS)
            .map(|item| element_to_json(&item))
            .collect();
        return Ok(json!({
            "name": name,
            "type": "set",
            "length": set.len(),
            "data": data,
            "truncated": set.len() > MAX_ITEMS,
        }));
    }

    if let Ok(set) = value.downcast::<PyFrozenSet>() {
        let data: Vec<Value> = set
            .iter()
            .take(MAX_ITEMS)
            .map(|item| element_to_json(&item))
            .collect();
        return Ok(json!({
            "name": name,
            "type": "frozenset",
            "length": set.len(),
            "data": data,
            "truncated": set.len() > MAX_ITEMS,
        }));
    }

    if let Ok(numpy) = py.import("numpy") {
        if value.is_instance(&numpy.getattr("ndarray")?)? {
            return serialize_ndarray(value, name);
        }
    }

    Ok(json!({
        "name": name,
        "type": type_name(value),
        "repr": safe_repr(value, 1000),
    }))
}

/// `type(value).__name__`, never failing.
fn type_name(value: &Bound<'_, PyAny>) -> String {
    value
        .get_type()
        .getattr("__name__")
        .and_then(|n| n.extract::<String>())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// A bounded `repr(value)`, never failing.
fn safe_repr(value: &Bound<'_, PyAny>, max_len: usize) -> String {
    match value.repr() {
        Ok(r) => {
            let r = r.to_string();
            if r.chars().count() > max_len {
                let cut: String = r.chars().take(max_len).collect();
                format!("{cut}...")
            } else {
                r
            }
        }
        Err(e) => format!("<repr failed: {e}>"),
    }
}

/// JSON-serializable values pass through; everything else becomes its repr.
fn element_to_json(item: &Bound<'_, PyAny>) -> Value {
    py_to_json(item).unwrap_or_else(|| json!(safe_repr(item, 200)))
}

/// Convert plain Python data (None/bool/int/float/str and nested
/// lists/tuples/dicts of them) to JSON. Returns `None` for anything else.
fn py_to_json(value: &Bound<'_, PyAny>) -> Option<Value> {
    if value.is_none() {
        return Some(Value::Null);
    }
    if value.is_instance_of::<PyBool>() {
        return value.extract::<bool>().ok().map(Value::from);
    }
    if let Ok(v) = value.extract::<i64>() {
        // Integers and integer-like scalars (numpy ints expose __index__)
        if !value.is_instance_of::<PyFloat>() {
            return Some(json!(v));
        }
    }
    if let Ok(v) = value.extract::<f64>() {
        return Some(if v.is_finite() { json!(v) } else { Value::Null });
    }
    if value.is_instance_of::<PyString>() {
        return value.extract::<String>().ok().map(Value::from);
    }
    if let Ok(list) = value.downcast::<PyList>() {
        let items: Option<Vec<Value>> = list.iter().map(|i| py_to_json(&i)).collect();
        return items.map(Value::from);
    }
    if let Ok(tuple) = value.downcast::<PyTuple>() {
        let items: Option<Vec<Value>> = tuple.iter().map(|i| py_to_json(&i)).collect();
        return items.map(Value::from);
    }
    if let Ok(dict) = value.downcast::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (key, val) in dict.iter() {
            let key_str = key.str().ok()?.to_string();
            map.insert(key_str, py_to_json(&val)?);
        }
        return Some(Value::Object(map));
    }
    None
}

fn serialize_ndarray(array: &Bound<'_, PyAny>, name: &str) -> PyResult<Value> {
    let dtype = array.getattr("dtype")?.str()?.to_string();
    let shape: Vec<i64> = array.getattr("shape")?.extract()?;
    let size: i64 = array.getattr("size")?.extract()?;

    let flat = array.call_method0("flatten")?;
    let mut data = Vec::new();
    for item in flat.try_iter()?.take(MAX_ITEMS) {
        let item = item?;
        if let Ok(f) = item.extract::<f64>() {
            if f.is_nan() {
                data.push(Value::Null);
                continue;
            }
        }
        // .item() converts numpy scalars to native Python values
        let native = item.call_method0("item").unwrap_or(item);
        data.push(py_to_json(&native).unwrap_or_else(|| {
            native
                .str()
                .map(|s| json!(s.to_string()))
                .unwrap_or(Value::Null)
        }));
    }

    Ok(json!({
        "name": name,
        "type": "ndarray",
        "dtype": dtype,
        "shape": shape,
        "size": size,
        "data": data,
        "truncated": size > MAX_ITEMS as i64,
    }))
}

fn serialize_dataframe(
    df: &Bound<'_, PyAny>,
    name: &str,
    pandas: &Bound<'_, PyModule>,
) -> PyResult<Value> {
    let py = df.py();
    let (rows, cols): (i64, i64) = df.getattr("shape")?.extract()?;

    let mut columns = Vec::new();
    for column in df.getattr("columns")?.call_method0("tolist")?.try_iter()? {
        let column = column?;
        let label = column.str()?.to_string();
        columns.push((column, label));
    }

    let mut dtypes = serde_json::Map::new();
    let mut columns_info = Vec::new();
    for (column, label) in &columns {
        let series = df.get_item(column)?;
        let dtype = series.getattr("dtype")?.str()?.to_string();
        dtypes.insert(label.clone(), json!(dtype));

        let null_count: i64 = series
            .call_method0("isnull")?
            .call_method0("sum")?
            .extract()?;
        let unique_count = if rows < UNIQUE_COUNT_CEILING {
            Some(series.call_method0("nunique")?.extract::<i64>()?)
        } else {
            None
        };
        columns_info.push(json!({
            "name": label,
            "dtype": dtype,
            "null_count": null_count,
            "unique_count": unique_count,
        }));
    }

    let head = df.call_method1("head", (PREVIEW_ROWS,))?;

    // Preview rows as record dicts, with datetime columns stringified.
    // Any failure here degrades to an empty preview.
    let preview = (|| -> PyResult<Value> {
        let preview_df = head.call_method0("copy")?;
        let api_types = pandas.getattr("api")?.getattr("types")?;
        for (column, _) in &columns {
            let series = preview_df.get_item(column)?;
            let is_datetime: bool = api_types
                .call_method1("is_datetime64_any_dtype", (&series,))?
                .extract()?;
            if is_datetime {
                preview_df.set_item(column, series.call_method1("astype", ("str",))?)?;
            }
        }
        let kwargs = PyDict::new(py);
        kwargs.set_item("orient", "records")?;
        let records = preview_df.call_method("to_dict", (), Some(&kwargs))?;
        Ok(py_to_json(&records).unwrap_or_else(|| json!([])))
    })()
    .unwrap_or_else(|_| json!([]));

    let markdown = (|| -> PyResult<String> {
        let kwargs = PyDict::new(py);
        kwargs.set_item("index", false)?;
        head.call_method("to_markdown", (), Some(&kwargs))?.extract()
    })()
    .ok();

    let column_names: Vec<&String> = columns.iter().map(|(_, label)| label).collect();

    Ok(json!({
        "name": name,
        "type": "DataFrame",
        "shape": [rows, cols],
        "rows": rows,
        "columns": cols,
        "column_names": column_names,
        "dtypes": dtypes,
        "columns_info": columns_info,
        "preview": preview,
        "preview_rows": rows.min(PREVIEW_ROWS as i64),
        "markdown": markdown,
    }))
}

fn serialize_series(series: &Bound<'_, PyAny>, name: &str) -> PyResult<Value> {
    let length: i64 = series.call_method0("__len__")?.extract()?;
    let dtype = series.getattr("dtype")?.str()?.to_string();
    let series_name = {
        let raw = series.getattr("name")?;
        if raw.is_none() {
            Value::Null
        } else {
            json!(raw.str()?.to_string())
        }
    };
    let null_count: i64 = series
        .call_method0("isnull")?
        .call_method0("sum")?
        .extract()?;

    let head = series.call_method1("head", (MAX_ITEMS,))?;
    let items = head.call_method0("tolist")?;
    let mut data = Vec::new();
    for item in items.try_iter()? {
        let item = item?;
        if item.is_none() {
            data.push(Value::Null);
            continue;
        }
        if let Ok(f) = item.extract::<f64>() {
            if f.is_nan() {
                data.push(Value::Null);
                continue;
            }
        }
        if item.is_instance_of::<PyDateTime>() || item.is_instance_of::<PyDate>() {
            data.push(json!(item.call_method0("isoformat")?.extract::<String>()?));
            continue;
        }
        data.push(py_to_json(&item).unwrap_or_else(|| {
            item.str()
                .map(|s| json!(s.to_string()))
                .unwrap_or(Value::Null)
        }));
    }

    Ok(json!({
        "name": name,
        "type": "Series",
        "series_name": series_name,
        "dtype": dtype,
        "length": length,
        "data": data,
        "truncated": length > MAX_ITEMS as i64,
        "null_count": null_count,
    }))
}
