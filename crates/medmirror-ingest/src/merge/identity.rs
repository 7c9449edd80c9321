// Identity keys
//
// Both functions are applied by the parsers and again by `prepare_row`, so
// a key computed in this run always equals one computed by a previous run.

/// Registry id: trimmed and uppercased
pub fn trial_key(raw: &str) -> Option<String> {
    let key = raw.trim().to_uppercase();
    (!key.is_empty()).then_some(key)
}

/// Generic drug name: uppercased with internal whitespace collapsed
pub fn drug_key(raw: &str) -> Option<String> {
    let key = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    (!key.is_empty()).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_key() {
        assert_eq!(trial_key(" nct00000102 ").as_deref(), Some("NCT00000102"));
        assert_eq!(trial_key("   "), None);
    }

    #[test]
    fn test_drug_key() {
        assert_eq!(drug_key("Albuterol   sulfate\t").as_deref(), Some("ALBUTEROL SULFATE"));
        assert_eq!(drug_key("ALBUTEROL"), drug_key("albuterol"));
        assert_eq!(drug_key(""), None);
    }
}
