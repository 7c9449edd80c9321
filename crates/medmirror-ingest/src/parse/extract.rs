//! Candidate-path field extraction
//!
//! Upstream schemas drift between vintages, so every canonical field is
//! described by an ordered list of [`FieldPath`]s. Scalars take the first
//! candidate that yields a non-empty value; lists collect from every
//! candidate and deduplicate case-insensitively.
//!
//! A candidate that resolves to something of the wrong shape (an object
//! where text was expected, say) is skipped. If no candidate yields a value
//! and at least one was malformed, the field is reported as dropped so the
//! caller can note it without losing the rest of the record.

use crate::merge::policy::union_ci;
use serde_json::Value;

/// Where to look for one field in one vintage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPath {
    /// JSON pointer to the value
    Pointer(&'static str),
    /// JSON pointer to an array, then a pointer inside each element
    /// (`""` for the element itself). A bare object is treated as a
    /// one-element array.
    Each(&'static str, &'static str),
    /// JSON pointer to a string holding several values joined by a separator
    Split(&'static str, &'static str),
}

impl FieldPath {
    fn resolve<'a>(&self, record: &'a Value) -> Vec<&'a Value> {
        match *self {
            FieldPath::Pointer(pointer) | FieldPath::Split(pointer, _) => {
                record.pointer(pointer).into_iter().collect()
            }
            FieldPath::Each(array, inner) => match record.pointer(array) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|item| item.pointer(inner))
                    .collect(),
                Some(item @ Value::Object(_)) => item.pointer(inner).into_iter().collect(),
                _ => Vec::new(),
            },
        }
    }

    fn separator(&self) -> Option<&'static str> {
        match *self {
            FieldPath::Split(_, sep) => Some(sep),
            _ => None,
        }
    }
}

enum Coerced<T> {
    Value(T),
    Absent,
    Malformed,
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_text(value: &Value) -> Coerced<String> {
    match value {
        Value::Null => Coerced::Absent,
        Value::Array(items) => {
            if items.iter().any(|i| i.is_object() || i.is_array()) {
                return Coerced::Malformed;
            }
            let parts: Vec<String> = items.iter().filter_map(scalar_text).collect();
            if parts.is_empty() {
                Coerced::Absent
            } else {
                Coerced::Value(parts.join("\n\n"))
            }
        }
        Value::Object(_) => Coerced::Malformed,
        scalar => match scalar_text(scalar) {
            Some(text) => Coerced::Value(text),
            None => Coerced::Absent,
        },
    }
}

fn coerce_list(value: &Value, separator: Option<&str>) -> Coerced<Vec<String>> {
    let items: Vec<String> = match value {
        Value::Null => return Coerced::Absent,
        Value::Object(_) => return Coerced::Malformed,
        Value::Array(items) => {
            if items.iter().all(|i| i.is_object() || i.is_array()) && !items.is_empty() {
                return Coerced::Malformed;
            }
            items.iter().filter_map(scalar_text).collect()
        }
        scalar => scalar_text(scalar).into_iter().collect(),
    };

    let items: Vec<String> = match separator {
        Some(sep) => items
            .iter()
            .flat_map(|item| item.split(sep))
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        None => items,
    };

    if items.is_empty() {
        Coerced::Absent
    } else {
        Coerced::Value(items)
    }
}

fn coerce_flag(value: &Value) -> Coerced<bool> {
    match value {
        Value::Null => Coerced::Absent,
        Value::Bool(b) => Coerced::Value(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "" => Coerced::Absent,
            "true" | "yes" | "y" | "1" => Coerced::Value(true),
            "false" | "no" | "n" | "0" => Coerced::Value(false),
            _ => Coerced::Malformed,
        },
        Value::Number(n) => Coerced::Value(n.as_f64().is_some_and(|f| f != 0.0)),
        _ => Coerced::Malformed,
    }
}

/// Field extraction over one upstream record
pub struct Extractor<'a> {
    record: &'a Value,
    dropped: Vec<&'static str>,
}

impl<'a> Extractor<'a> {
    pub fn new(record: &'a Value) -> Self {
        Self {
            record,
            dropped: Vec::new(),
        }
    }

    /// First non-empty text among the candidates
    pub fn text(&mut self, field: &'static str, paths: &[FieldPath]) -> Option<String> {
        let mut malformed = false;
        for path in paths {
            for value in path.resolve(self.record) {
                match coerce_text(value) {
                    Coerced::Value(text) => return Some(text),
                    Coerced::Malformed => malformed = true,
                    Coerced::Absent => {}
                }
            }
        }
        if malformed {
            self.dropped.push(field);
        }
        None
    }

    /// Union of every candidate, deduplicated case-insensitively
    pub fn list(&mut self, field: &'static str, paths: &[FieldPath]) -> Vec<String> {
        let mut collected = Vec::new();
        let mut malformed = false;
        for path in paths {
            for value in path.resolve(self.record) {
                match coerce_list(value, path.separator()) {
                    Coerced::Value(items) => collected = union_ci(&collected, &items),
                    Coerced::Malformed => malformed = true,
                    Coerced::Absent => {}
                }
            }
        }
        if collected.is_empty() && malformed {
            self.dropped.push(field);
        }
        collected
    }

    /// True if any candidate says so
    pub fn flag(&mut self, field: &'static str, paths: &[FieldPath]) -> bool {
        let mut malformed = false;
        let mut seen = false;
        for path in paths {
            for value in path.resolve(self.record) {
                match coerce_flag(value) {
                    Coerced::Value(true) => return true,
                    Coerced::Value(false) => seen = true,
                    Coerced::Malformed => malformed = true,
                    Coerced::Absent => {}
                }
            }
        }
        if !seen && malformed {
            self.dropped.push(field);
        }
        false
    }

    /// Whether any candidate resolves to a non-null value
    pub fn present(&self, paths: &[FieldPath]) -> bool {
        paths
            .iter()
            .any(|p| p.resolve(self.record).iter().any(|v| !v.is_null()))
    }

    /// Fields dropped because every candidate was malformed
    pub fn dropped(&self) -> &[&'static str] {
        &self.dropped
    }

    pub fn into_dropped(self) -> Vec<&'static str> {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TITLE: &[FieldPath] = &[
        FieldPath::Pointer("/protocolSection/identificationModule/briefTitle"),
        FieldPath::Pointer("/brief_title"),
    ];

    #[test]
    fn test_first_non_empty_candidate_wins() {
        let record = json!({
            "protocolSection": {"identificationModule": {"briefTitle": "   "}},
            "brief_title": "Albuterol in Asthma"
        });
        let mut ext = Extractor::new(&record);
        assert_eq!(ext.text("brief_title", TITLE).as_deref(), Some("Albuterol in Asthma"));
        assert!(ext.dropped().is_empty());
    }

    #[test]
    fn test_malformed_scalar_is_dropped_not_fatal() {
        let record = json!({"brief_title": {"unexpected": "object"}});
        let mut ext = Extractor::new(&record);
        assert_eq!(ext.text("brief_title", TITLE), None);
        assert_eq!(ext.dropped(), ["brief_title"]);
    }

    #[test]
    fn test_text_array_is_joined() {
        let record = json!({"indications_and_usage": ["First paragraph.", "Second."]});
        let mut ext = Extractor::new(&record);
        let text = ext.text("indications", &[FieldPath::Pointer("/indications_and_usage")]);
        assert_eq!(text.as_deref(), Some("First paragraph.\n\nSecond."));
    }

    #[test]
    fn test_list_collects_all_variants_case_insensitively() {
        let record = json!({
            "locations": [{"city": "Boston"}, {"city": "boston"}, {"city": "Chicago"}],
            "flat_locations": "Chicago|Denver"
        });
        let mut ext = Extractor::new(&record);
        let cities = ext.list(
            "locations",
            &[
                FieldPath::Each("/locations", "/city"),
                FieldPath::Split("/flat_locations", "|"),
            ],
        );
        assert_eq!(cities, vec!["Boston", "Chicago", "Denver"]);
    }

    #[test]
    fn test_each_accepts_single_object() {
        let record = json!({"Location": {"LocationCity": "Lyon"}});
        let mut ext = Extractor::new(&record);
        let cities = ext.list("locations", &[FieldPath::Each("/Location", "/LocationCity")]);
        assert_eq!(cities, vec!["Lyon"]);
    }

    #[test]
    fn test_flag_coercion() {
        let record = json!({"hasResults": "Yes", "other": false});
        let mut ext = Extractor::new(&record);
        assert!(ext.flag("has_results", &[FieldPath::Pointer("/other"), FieldPath::Pointer("/hasResults")]));
        assert!(!ext.flag("has_results", &[FieldPath::Pointer("/missing")]));
    }
}
