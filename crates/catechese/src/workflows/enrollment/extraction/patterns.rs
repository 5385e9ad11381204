use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::workflows::enrollment::domain::{DocumentKind, Extraction};
use crate::workflows::enrollment::payment::provider::{normalize_reference, Provider};
use crate::workflows::legacy::normalize_phone;

/// How a captured value is cleaned before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldShape {
    Text,
    Date,
    Amount,
    Reference,
    Phone,
    Provider,
}

struct FieldPattern {
    field: &'static str,
    shape: FieldShape,
    /// Heuristic confidence of a clean match for this pattern.
    weight: f32,
    regex: Regex,
}

const DATE_TEXT: &str = r"\d{1,2}[/.\-]\d{1,2}[/.\-]\d{4}";
const DATE: &str = r"(\d{1,2}[/.\-]\d{1,2}[/.\-]\d{4})";

fn pattern(field: &'static str, shape: FieldShape, weight: f32, source: &str) -> FieldPattern {
    FieldPattern {
        field,
        shape,
        weight,
        regex: Regex::new(source).expect("extraction pattern compiles"),
    }
}

fn name_patterns() -> Vec<FieldPattern> {
    vec![
        pattern(
            "surname",
            FieldShape::Text,
            0.75,
            r"(?im)^\s*nom(?:\s+de\s+famille)?\s*:\s*(.+?)\s*$",
        ),
        pattern(
            "given_names",
            FieldShape::Text,
            0.75,
            r"(?im)^\s*pr[ée]noms?\s*:\s*(.+?)\s*$",
        ),
    ]
}

fn patterns_for(kind: DocumentKind) -> &'static [FieldPattern] {
    static BIRTH: OnceLock<Vec<FieldPattern>> = OnceLock::new();
    static BAPTISM: OnceLock<Vec<FieldPattern>> = OnceLock::new();
    static TRANSFER: OnceLock<Vec<FieldPattern>> = OnceLock::new();
    static RECEIPT: OnceLock<Vec<FieldPattern>> = OnceLock::new();

    match kind {
        DocumentKind::BirthCertificate => BIRTH.get_or_init(|| {
            let mut patterns = name_patterns();
            patterns.push(pattern(
                "birth_date",
                FieldShape::Date,
                0.9,
                &format!(r"(?i)(?:date\s+de\s+naissance\s*:|n[ée]e?(?:\(e\))?\s+le)\s*{DATE}"),
            ));
            patterns.push(pattern(
                "birth_place",
                FieldShape::Text,
                0.7,
                r"(?im)^\s*lieu\s+de\s+naissance\s*:\s*(.+?)\s*$",
            ));
            patterns.push(pattern(
                "birth_place",
                FieldShape::Text,
                0.7,
                &format!(r"(?im)n[ée]e?(?:\(e\))?\s+le\s+{DATE_TEXT}\s+[àa]\s+(.+?)\s*$"),
            ));
            patterns
        }),
        DocumentKind::BaptismCertificate => BAPTISM.get_or_init(|| {
            let mut patterns = name_patterns();
            patterns.push(pattern(
                "baptism_date",
                FieldShape::Date,
                0.9,
                &format!(
                    r"(?i)(?:date\s+d[ue]\s+bapt[êe]me\s*:|baptis[ée]e?(?:\(e\))?\s+le)\s*{DATE}"
                ),
            ));
            patterns.push(pattern(
                "baptism_parish",
                FieldShape::Text,
                0.75,
                r"(?im)^\s*paroisse\s*:\s*(.+?)\s*$",
            ));
            patterns.push(pattern(
                "baptism_parish",
                FieldShape::Text,
                0.7,
                r"(?im)en\s+la\s+paroisse\s+(.+?)\s*$",
            ));
            patterns
        }),
        DocumentKind::TransferAttestation => TRANSFER.get_or_init(|| {
            let mut patterns = name_patterns();
            patterns.push(pattern(
                "origin_parish",
                FieldShape::Text,
                0.75,
                r"(?im)^\s*paroisse(?:\s+d'origine)?\s*:\s*(.+?)\s*$",
            ));
            patterns.push(pattern(
                "last_level",
                FieldShape::Text,
                0.7,
                r"(?im)^\s*(?:niveau|classe)(?:\s+suivie)?\s*:\s*(.+?)\s*$",
            ));
            patterns
        }),
        DocumentKind::PaymentReceipt => RECEIPT.get_or_init(|| {
            vec![
                pattern(
                    "reference",
                    FieldShape::Reference,
                    0.9,
                    r"(?i)\b((?:OM|MV|WV)\s?\d{8,15})\b",
                ),
                pattern(
                    "reference",
                    FieldShape::Reference,
                    0.8,
                    r"(?im)r[ée]f(?:[ée]rence)?\.?\s*(?:de\s+transaction)?\s*:\s*([A-Z0-9 ]+?)\s*$",
                ),
                pattern(
                    "amount",
                    FieldShape::Amount,
                    0.85,
                    r"(?i)montant\s*:?\s*(\d[\d .\u{a0}]*)\s*(?:fcfa|xof|cfa|f)\b",
                ),
                pattern(
                    "amount",
                    FieldShape::Amount,
                    0.7,
                    r"(?i)(\d[\d .\u{a0}]*)\s*(?:fcfa|xof)\b",
                ),
                pattern("date", FieldShape::Date, 0.9, DATE),
                pattern(
                    "phone",
                    FieldShape::Phone,
                    0.8,
                    r"(?i)(?:t[ée]l(?:[ée]phone)?|num[ée]ro|exp[ée]diteur)\s*:?\s*(\+?\d[\d ]{7,15}\d)",
                ),
                pattern(
                    "provider",
                    FieldShape::Provider,
                    0.8,
                    r"(?i)\b(orange\s+money|moov\s+money|wave)\b",
                ),
            ]
        }),
    }
}

/// Run every pattern of `kind` over the concatenated OCR text.
///
/// Every required field of the kind is present in the result, empty with zero confidence when
/// no pattern matched. When a capture cannot be normalized the raw text is kept at half weight.
pub(crate) fn extract_fields(kind: DocumentKind, text: &str) -> Extraction {
    let mut fields = BTreeMap::new();
    let mut field_confidence = BTreeMap::new();

    for field in kind.required_fields() {
        fields.insert((*field).to_string(), String::new());
        field_confidence.insert((*field).to_string(), 0.0);
    }

    for candidate in patterns_for(kind) {
        let already_found = fields
            .get(candidate.field)
            .map(|value: &String| !value.is_empty())
            .unwrap_or(false);
        if already_found {
            continue;
        }

        let Some(raw) = candidate
            .regex
            .captures(text)
            .and_then(|captures| captures.get(1))
            .map(|capture| capture.as_str().trim().to_string())
            .filter(|value| !value.is_empty())
        else {
            continue;
        };

        let (value, confidence) = match normalize(candidate.shape, &raw) {
            Some(clean) => (clean, candidate.weight),
            None => (raw, candidate.weight / 2.0),
        };
        fields.insert(candidate.field.to_string(), value);
        field_confidence.insert(candidate.field.to_string(), confidence);
    }

    Extraction {
        fields,
        field_confidence,
    }
}

fn normalize(shape: FieldShape, raw: &str) -> Option<String> {
    match shape {
        FieldShape::Text => {
            let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            (!collapsed.is_empty()).then_some(collapsed)
        }
        FieldShape::Date => parse_loose_date(raw).map(|date| date.format("%d/%m/%Y").to_string()),
        FieldShape::Amount => {
            let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
            digits.parse::<u64>().ok().map(|amount| amount.to_string())
        }
        FieldShape::Reference => {
            let reference = normalize_reference(raw);
            (!reference.is_empty()).then_some(reference)
        }
        FieldShape::Phone => {
            let phone = normalize_phone(raw);
            (phone.len() >= 8).then_some(phone)
        }
        FieldShape::Provider => Provider::from_name(raw).map(|provider| provider.code().to_string()),
    }
}

/// Day-first date with `/`, `.` or `-` separators.
pub(crate) fn parse_loose_date(raw: &str) -> Option<NaiveDate> {
    let mut parts = raw.trim().split(['/', '.', '-']);
    let day: u32 = parts.next()?.trim().parse().ok()?;
    let month: u32 = parts.next()?.trim().parse().ok()?;
    let year: i32 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn birth_certificate_fields_are_read_from_labelled_lines() {
        let text = "REPUBLIQUE DU BURKINA FASO\nACTE DE NAISSANCE N° 1234\nNom : OUEDRAOGO\nPrénoms : Marie Claire\nNée le 12/03/2016 à Ouagadougou\n";
        let extraction = extract_fields(DocumentKind::BirthCertificate, text);
        assert_eq!(extraction.value("surname"), Some("OUEDRAOGO"));
        assert_eq!(extraction.value("given_names"), Some("Marie Claire"));
        assert_eq!(extraction.value("birth_date"), Some("12/03/2016"));
        assert_eq!(extraction.value("birth_place"), Some("Ouagadougou"));
        assert_eq!(extraction.field_confidence["birth_date"], 0.9);
        assert_eq!(extraction.field_confidence["birth_place"], 0.7);
    }

    #[test]
    fn missing_fields_are_present_but_empty() {
        let extraction = extract_fields(DocumentKind::BirthCertificate, "illisible");
        for field in DocumentKind::BirthCertificate.required_fields() {
            assert_eq!(extraction.fields.get(*field).map(String::as_str), Some(""));
            assert_eq!(extraction.field_confidence.get(*field), Some(&0.0));
        }
    }

    #[test]
    fn impossible_dates_keep_raw_text_at_half_weight() {
        let text = "Date de naissance : 31/02/2016";
        let extraction = extract_fields(DocumentKind::BirthCertificate, text);
        assert_eq!(extraction.value("birth_date"), Some("31/02/2016"));
        assert_eq!(extraction.field_confidence["birth_date"], 0.45);
    }

    #[test]
    fn receipt_fields_are_normalized() {
        let text = "Orange Money\nTransfert effectué\nMontant : 10 000 FCFA\nRéf : OM 123456789\nTél : +226 70 11 22 33\nLe 02.09.2025 à 10:14";
        let extraction = extract_fields(DocumentKind::PaymentReceipt, text);
        assert_eq!(extraction.value("reference"), Some("OM123456789"));
        assert_eq!(extraction.value("amount"), Some("10000"));
        assert_eq!(extraction.value("date"), Some("02/09/2025"));
        assert_eq!(extraction.value("phone"), Some("22670112233"));
        assert_eq!(extraction.value("provider"), Some("OM"));
    }

    #[test]
    fn baptism_and_transfer_kinds_use_their_own_fields() {
        let baptism = extract_fields(
            DocumentKind::BaptismCertificate,
            "Nom : KABORE\nPrénoms : Paul\nBaptisé le 05/06/2016\nParoisse : Saint Joseph",
        );
        assert_eq!(baptism.value("baptism_date"), Some("05/06/2016"));
        assert_eq!(baptism.value("baptism_parish"), Some("Saint Joseph"));

        let transfer = extract_fields(
            DocumentKind::TransferAttestation,
            "Nom : KABORE\nPrénoms : Paul\nParoisse d'origine : Sainte Anne\nNiveau : CE2",
        );
        assert_eq!(transfer.value("origin_parish"), Some("Sainte Anne"));
        assert_eq!(transfer.value("last_level"), Some("CE2"));
    }
}
