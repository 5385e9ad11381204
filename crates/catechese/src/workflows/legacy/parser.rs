use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer};
use std::io::Read;

/// One line of the historical register: a parent and, optionally, one of their children.
#[derive(Debug)]
pub(crate) struct LegacyRow {
    pub(crate) parent_code: String,
    pub(crate) parent_last_name: String,
    pub(crate) parent_first_name: String,
    pub(crate) phone: String,
    pub(crate) child: Option<LegacyChildRow>,
}

#[derive(Debug)]
pub(crate) struct LegacyChildRow {
    pub(crate) code: String,
    pub(crate) last_name: String,
    pub(crate) first_names: String,
    pub(crate) birth_date: Option<NaiveDate>,
    pub(crate) birth_year: Option<i32>,
    pub(crate) level: Option<String>,
}

pub(crate) fn parse_rows<R: Read>(reader: R) -> Result<Vec<LegacyRow>, csv::Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let mut rows = Vec::new();

    for record in csv_reader.deserialize::<RegisterRow>() {
        let row = record?;
        let child = row.child();
        rows.push(LegacyRow {
            parent_code: row.parent_code,
            parent_last_name: row.parent_last_name,
            parent_first_name: row.parent_first_name.unwrap_or_default(),
            phone: row.phone,
            child,
        });
    }

    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct RegisterRow {
    #[serde(rename = "Code Parent")]
    parent_code: String,
    #[serde(rename = "Nom Parent")]
    parent_last_name: String,
    #[serde(
        rename = "Prenom Parent",
        default,
        deserialize_with = "empty_string_as_none"
    )]
    parent_first_name: Option<String>,
    #[serde(rename = "Telephone")]
    phone: String,
    #[serde(
        rename = "Code Enfant",
        default,
        deserialize_with = "empty_string_as_none"
    )]
    child_code: Option<String>,
    #[serde(rename = "Nom", default, deserialize_with = "empty_string_as_none")]
    child_last_name: Option<String>,
    #[serde(rename = "Prenoms", default, deserialize_with = "empty_string_as_none")]
    child_first_names: Option<String>,
    #[serde(
        rename = "Date Naissance",
        default,
        deserialize_with = "empty_string_as_none"
    )]
    birth_date: Option<String>,
    #[serde(
        rename = "Annee Naissance",
        default,
        deserialize_with = "empty_string_as_none"
    )]
    birth_year: Option<String>,
    #[serde(rename = "Niveau", default, deserialize_with = "empty_string_as_none")]
    level: Option<String>,
}

impl RegisterRow {
    fn child(&self) -> Option<LegacyChildRow> {
        let code = self.child_code.clone()?;
        let birth_date = self.birth_date.as_deref().and_then(parse_date);
        let birth_year = birth_date.map(|date| date.year()).or_else(|| {
            self.birth_year
                .as_deref()
                .and_then(|year| year.trim().parse::<i32>().ok())
                .filter(|year| (1900..=2100).contains(year))
        });

        Some(LegacyChildRow {
            code,
            last_name: self.child_last_name.clone().unwrap_or_default(),
            first_names: self.child_first_names.clone().unwrap_or_default(),
            birth_date,
            birth_year,
            level: self.level.clone(),
        })
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.filter(|value| !value.trim().is_empty()))
}

/// The register mixes `DD/MM/YYYY` and ISO dates.
pub(crate) fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    NaiveDate::parse_from_str(trimmed, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .ok()
}
