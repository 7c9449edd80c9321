// Delimited text decoding
//
// The NDC product table (tab) and the Orange Book (`~`) are header-first
// delimited text. Rows are turned into JSON objects keyed by header so the
// same candidate-path extraction handles them as the JSON sources.
// Fields are unquoted upstream; free text may contain stray `"` characters,
// so quoting is disabled. Non-UTF-8 bytes are replaced rather than rejected.

use crate::error::Result;
use serde_json::{Map, Value};

pub fn rows_to_objects(data: &[u8], delimiter: u8) -> Result<Vec<Value>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(data);

    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record?;
        let mut object = Map::with_capacity(headers.len());
        for (header, field) in headers.iter().zip(record.iter()) {
            let value = String::from_utf8_lossy(field);
            let value = value.trim();
            if !header.is_empty() && !value.is_empty() {
                object.insert(header.clone(), Value::String(value.to_string()));
            }
        }
        if !object.is_empty() {
            rows.push(Value::Object(object));
        }
    }

    Ok(rows)
}
