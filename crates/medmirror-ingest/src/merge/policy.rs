//! Field-level merge policy
//!
//! The same rules are implemented in SQL by the `mirror_*` functions of the
//! schema migration; the two must stay in step so that merging in memory and
//! re-ingesting through the upsert give identical rows.
//!
//! | field kind          | rule                                               |
//! |---------------------|----------------------------------------------------|
//! | lists               | union, first-seen casing, case-insensitive dedup   |
//! | free text           | non-empty and longer wins, ties keep existing      |
//! | scores              | maximum                                            |
//! | capability flags    | logical OR                                         |
//! | formulations        | append; same NDC is a shallow field override       |
//! | interaction maps    | key-level override                                 |
//!
//! Text length is measured in characters, matching PostgreSQL `length()`.
//! Case folding is ASCII-only and blank means only the [`BLANK`] characters,
//! the subset on which Rust and `lower(x COLLATE "C")`/`btrim` agree.

use crate::models::Formulation;
use std::collections::{BTreeMap, HashSet};

/// Characters trimmed by `btrim(x, E' \t\n\r\f')` in the SQL functions
pub const BLANK: &[char] = &[' ', '\t', '\n', '\r', '\x0C'];

pub fn is_blank(value: &str) -> bool {
    value.trim_matches(BLANK).is_empty()
}

/// Union of two lists, deduplicated case-insensitively
///
/// Existing entries keep their position and casing; incoming entries are
/// appended in order when not already present. Blank entries are dropped.
pub fn union_ci(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(existing.len() + incoming.len());
    existing
        .iter()
        .chain(incoming.iter())
        .filter(|item| !is_blank(item))
        .filter(|item| seen.insert(item.to_ascii_lowercase()))
        .cloned()
        .collect()
}

fn non_blank(value: Option<&String>) -> Option<&String> {
    value.filter(|s| !is_blank(s))
}

/// Keep whichever text is non-empty and longer; ties keep `existing`
pub fn prefer_longer(existing: Option<&String>, incoming: Option<&String>) -> Option<String> {
    match (non_blank(existing), non_blank(incoming)) {
        (Some(e), Some(i)) if i.chars().count() > e.chars().count() => Some(i.clone()),
        (Some(e), _) => Some(e.clone()),
        (None, Some(i)) => Some(i.clone()),
        (None, None) => None,
    }
}

pub fn max_score(existing: f64, incoming: f64) -> f64 {
    existing.max(incoming)
}

/// Append incoming formulations, overriding fields of same-NDC entries
pub fn merge_formulations(existing: &[Formulation], incoming: &[Formulation]) -> Vec<Formulation> {
    let mut merged = existing.to_vec();

    for entry in incoming.iter().filter(|f| !f.is_empty()) {
        let same_ndc = entry.ndc.as_ref().and_then(|ndc| {
            merged
                .iter()
                .position(|m| m.ndc.as_deref() == Some(ndc.as_str()))
        });

        match same_ndc {
            Some(index) => overlay(&mut merged[index], entry),
            None if merged.contains(entry) => {}
            None => merged.push(entry.clone()),
        }
    }

    merged
}

fn overlay(target: &mut Formulation, incoming: &Formulation) {
    fn set(slot: &mut Option<String>, value: &Option<String>) {
        if value.is_some() {
            slot.clone_from(value);
        }
    }
    set(&mut target.brand_name, &incoming.brand_name);
    set(&mut target.dosage_form, &incoming.dosage_form);
    set(&mut target.route, &incoming.route);
    set(&mut target.strength, &incoming.strength);
    set(&mut target.application_number, &incoming.application_number);
    set(&mut target.te_code, &incoming.te_code);
    set(&mut target.marketing_category, &incoming.marketing_category);
}

/// Key-level override, incoming wins
pub fn merge_map(existing: &BTreeMap<String, String>, incoming: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = existing.clone();
    merged.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_union_ci_keeps_first_casing() {
        assert_eq!(
            union_ci(&s(&["Boston"]), &s(&["boston", "Chicago"])),
            s(&["Boston", "Chicago"])
        );
        assert_eq!(union_ci(&s(&["A", "a", " "]), &[]), s(&["A"]));
    }

    #[test]
    fn test_union_ci_folds_ascii_only() {
        // Non-ASCII case variants and non-breaking spaces are kept as-is
        assert_eq!(
            union_ci(&s(&["Évry", "\u{a0}"]), &s(&["évry", "ÉVRY", "\t\x0C"])),
            s(&["Évry", "\u{a0}", "évry"])
        );
        assert!(is_blank(" \r\n"));
        assert!(!is_blank("\u{2003}"));
    }

    #[test]
    fn test_prefer_longer() {
        let short = "abc".to_string();
        let long = "abcdef".to_string();
        let blank = "  ".to_string();
        let tie = "xyz".to_string();

        assert_eq!(prefer_longer(Some(&short), Some(&long)), Some(long.clone()));
        assert_eq!(prefer_longer(Some(&long), Some(&short)), Some(long.clone()));
        assert_eq!(prefer_longer(Some(&short), Some(&tie)), Some(short.clone()));
        assert_eq!(prefer_longer(Some(&short), Some(&blank)), Some(short.clone()));
        assert_eq!(prefer_longer(Some(&blank), None), None);
        assert_eq!(prefer_longer(None, Some(&short)), Some(short));
    }

    #[test]
    fn test_prefer_longer_counts_characters() {
        let accented = "éé".to_string();
        let ascii = "abc".to_string();
        assert_eq!(prefer_longer(Some(&accented), Some(&ascii)), Some(ascii));
    }

    #[test]
    fn test_merge_formulations_overrides_same_ndc() {
        let existing = vec![Formulation {
            ndc: Some("0001".into()),
            strength: Some("90 ug".into()),
            ..Default::default()
        }];
        let incoming = vec![
            Formulation {
                ndc: Some("0001".into()),
                brand_name: Some("Ventolin".into()),
                ..Default::default()
            },
            Formulation {
                te_code: Some("AB".into()),
                ..Default::default()
            },
        ];

        let merged = merge_formulations(&existing, &incoming);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].strength.as_deref(), Some("90 ug"));
        assert_eq!(merged[0].brand_name.as_deref(), Some("Ventolin"));

        assert_eq!(merge_formulations(&merged, &incoming), merged);
    }

    #[test]
    fn test_merge_map_override() {
        let mut a = BTreeMap::new();
        a.insert("drug_labels".to_string(), "old".to_string());
        a.insert("other".to_string(), "kept".to_string());
        let mut b = BTreeMap::new();
        b.insert("drug_labels".to_string(), "new".to_string());

        let merged = merge_map(&a, &b);
        assert_eq!(merged["drug_labels"], "new");
        assert_eq!(merged["other"], "kept");
    }
}
