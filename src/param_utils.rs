use std::collections::HashMap;

/// Get a parameter value with a default fallback
pub fn get_param(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Extract a parameter as f64, clamped to a range with finite checks
pub fn get_param_f64_clamped(
    params: &HashMap<String, f64>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> f64 {
    let raw = params.get(key).copied().unwrap_or(default);
    if !raw.is_finite() {
        return default;
    }
    raw.clamp(min, max)
}

/// Extract a parameter as usize, rounded and clamped to a range with finite checks
pub fn get_param_usize_rounded_clamped(
    params: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> usize {
    let raw = params.get(key).copied().unwrap_or(default as f64);
    if !raw.is_finite() {
        return default;
    }
    raw.round().clamp(min as f64, max as f64).max(min as f64) as usize
}

/// Canonical cache/dedupe key for a parameter combination: keys sorted,
/// values rendered with enough precision to distinguish neighbors.
pub fn parameter_signature(params: &HashMap<String, f64>) -> String {
    let mut entries: Vec<(&String, &f64)> = params.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .iter()
        .map(|(key, value)| format!("{}={:.10}", key, value))
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_get_param_defaults() {
        let p = params(&[("a", 2.5)]);
        assert_eq!(get_param(&p, "a", 0.0), 2.5);
        assert_eq!(get_param(&p, "missing", 7.0), 7.0);
    }

    #[test]
    fn test_clamped_accessors_reject_non_finite() {
        let p = params(&[("x", f64::NAN), ("y", 99.0)]);
        assert_eq!(get_param_f64_clamped(&p, "x", 0.5, 0.0, 1.0), 0.5);
        assert_eq!(get_param_f64_clamped(&p, "y", 0.5, 0.0, 1.0), 1.0);
        assert_eq!(get_param_usize_rounded_clamped(&p, "y", 10, 2, 50), 50);
        assert_eq!(get_param_usize_rounded_clamped(&p, "x", 10, 2, 50), 10);
    }

    #[test]
    fn test_parameter_signature_is_order_independent() {
        let a = params(&[("fast", 12.0), ("slow", 26.0)]);
        let b = params(&[("slow", 26.0), ("fast", 12.0)]);
        assert_eq!(parameter_signature(&a), parameter_signature(&b));
        let c = params(&[("fast", 12.0), ("slow", 27.0)]);
        assert_ne!(parameter_signature(&a), parameter_signature(&c));
    }
}
