//! JSON -> CSV projection for `Accept: text/csv` content negotiation.

use serde_json::Value;

/// Project a JSON array of flat objects into CSV, header row first. Falls
/// back to a single `value` column for a non-array/non-object body.
pub fn project_json_to_csv(body: &[u8]) -> anyhow::Result<Vec<u8>> {
    let value: Value = serde_json::from_slice(body)?;
    let rows: Vec<Value> = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut columns: Vec<String> = Vec::new();
    for row in &rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    if columns.is_empty() {
        columns.push("value".to_string());
    }

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(&columns)?;
    for row in &rows {
        let record: Vec<String> = match row {
            Value::Object(map) => columns
                .iter()
                .map(|col| {
                    map.get(col)
                        .map(scalar_to_string)
                        .unwrap_or_default()
                })
                .collect(),
            other => vec![scalar_to_string(other)],
        };
        writer.write_record(&record)?;
    }
    Ok(writer.into_inner()?)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `Content-Disposition` filename derived from the last path segment and
/// query string, e.g. `/data?x=1` -> `data_x=1.csv`.
pub fn filename_for(path: &str, query: &str) -> String {
    let last_segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or("download");
    let base = if last_segment.is_empty() {
        "download"
    } else {
        last_segment
    };
    format!("{base}_{query}.csv")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_array_of_objects_with_header_row() {
        let csv = project_json_to_csv(br#"[{"a":1,"b":"x"},{"a":2,"b":"y"}]"#).unwrap();
        assert_eq!(csv, b"a,b\n1,x\n2,y\n");
    }

    #[test]
    fn filename_combines_last_segment_and_query() {
        assert_eq!(filename_for("/data", ""), "data_.csv");
        assert_eq!(filename_for("/data/", "x=1"), "data_x=1.csv");
    }
}
