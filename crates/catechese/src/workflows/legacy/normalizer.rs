/// Collapse whitespace, drop invisible characters, and lowercase.
pub(crate) fn normalize_label(value: &str) -> String {
    let cleaned = value.replace(['\u{feff}', '\u{200b}'], "");
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    fold_accents(&collapsed.to_lowercase())
}

/// Digits only, international `00` prefix removed.
pub fn normalize_phone(value: &str) -> String {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    match digits.strip_prefix("00") {
        Some(rest) => rest.to_string(),
        None => digits,
    }
}

/// Local subscriber number: the last eight digits, so `+226 70 11 22 33` matches `70112233`.
pub fn phone_key(value: &str) -> String {
    let digits = normalize_phone(value);
    let keep = 8.min(digits.len());
    digits[digits.len() - keep..].to_string()
}

pub(crate) fn fold_accents(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ï' => 'i',
            'ô' | 'ö' => 'o',
            'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}
