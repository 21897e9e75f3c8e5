use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::SynthesisError;

const SUFFIXES: &[&str] = &[
    "", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "n", "u", "m", "k", "M", "G", "T",
    "P", "E",
];

/// Validate a Kubernetes quantity string ("10Gi", "500M", "1e3", "0.5").
///
/// The API server stores quantities in their canonical form; this only
/// checks the grammar so a malformed value surfaces as a synthesis error
/// instead of a rejected create. Negative values are refused since every
/// quantity here is a size.
pub fn parse_quantity(raw: &str) -> Result<Quantity, SynthesisError> {
    let invalid = || SynthesisError::InvalidQuantity(raw.to_string());
    let unsigned = raw.strip_prefix('+').unwrap_or(raw);
    let split = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(split);

    if !is_number(number) || !is_suffix(suffix) {
        return Err(invalid());
    }
    Ok(Quantity(raw.to_string()))
}

fn is_number(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit()) && s.matches('.').count() <= 1
}

fn is_suffix(s: &str) -> bool {
    if SUFFIXES.contains(&s) {
        return true;
    }
    let Some(exp) = s.strip_prefix(['e', 'E']) else {
        return false;
    };
    let digits = exp.strip_prefix(['+', '-']).unwrap_or(exp);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}
