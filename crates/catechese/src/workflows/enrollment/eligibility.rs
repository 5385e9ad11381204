use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use super::domain::{CatecheticalYear, ClassLevel};
use crate::workflows::legacy::{
    LegacyCatechumen, LegacyDirectory, LegacyLookupError, LegacyParent,
};

/// Inclusive age range admitted into a class level. Bands may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBand {
    pub level: ClassLevel,
    pub min_age: u8,
    pub max_age: u8,
}

pub const DEFAULT_AGE_BANDS: [AgeBand; 6] = [
    AgeBand {
        level: ClassLevel::Eveil,
        min_age: 4,
        max_age: 6,
    },
    AgeBand {
        level: ClassLevel::Ce1,
        min_age: 6,
        max_age: 8,
    },
    AgeBand {
        level: ClassLevel::Ce2,
        min_age: 7,
        max_age: 9,
    },
    AgeBand {
        level: ClassLevel::Cm1,
        min_age: 8,
        max_age: 10,
    },
    AgeBand {
        level: ClassLevel::Cm2,
        min_age: 9,
        max_age: 11,
    },
    AgeBand {
        level: ClassLevel::Confirmation,
        min_age: 12,
        max_age: 15,
    },
];

const MAX_PLAUSIBLE_AGE: i32 = 120;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EligibilityError {
    #[error("birth date {0} is in the future")]
    BirthDateInFuture(NaiveDate),
    #[error("birth date {0} gives an implausible age")]
    ImplausibleAge(NaiveDate),
}

/// Completed years between `birth` and `on`, counting a birthday only once it has passed.
pub fn age_from_birthdate(birth: NaiveDate, on: NaiveDate) -> Result<u8, EligibilityError> {
    if birth > on {
        return Err(EligibilityError::BirthDateInFuture(birth));
    }

    let mut age = on.year() - birth.year();
    if (on.month(), on.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }

    if age > MAX_PLAUSIBLE_AGE {
        return Err(EligibilityError::ImplausibleAge(birth));
    }
    u8::try_from(age).map_err(|_| EligibilityError::ImplausibleAge(birth))
}

/// Every level whose band contains `age`, in curriculum order.
pub fn classes_for_age(bands: &[AgeBand], age: u8) -> Vec<ClassLevel> {
    let mut levels: Vec<ClassLevel> = bands
        .iter()
        .filter(|band| (band.min_age..=band.max_age).contains(&age))
        .map(|band| band.level)
        .collect();
    levels.sort();
    levels.dedup();
    levels
}

/// Class proposal for a child coming back from a previous year.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSuggestion {
    pub age: Option<u8>,
    pub admissible: Vec<ClassLevel>,
    pub suggested: Option<ClassLevel>,
}

/// Age and class rules plus access to the historical register.
pub struct EligibilityResolver {
    directory: Arc<dyn LegacyDirectory>,
    bands: Vec<AgeBand>,
}

impl EligibilityResolver {
    pub fn new(directory: Arc<dyn LegacyDirectory>) -> Self {
        Self::with_bands(directory, DEFAULT_AGE_BANDS.to_vec())
    }

    pub fn with_bands(directory: Arc<dyn LegacyDirectory>, bands: Vec<AgeBand>) -> Self {
        Self { directory, bands }
    }

    pub fn age_from_birthdate(
        &self,
        birth: NaiveDate,
        on: NaiveDate,
    ) -> Result<u8, EligibilityError> {
        age_from_birthdate(birth, on)
    }

    pub fn classes_for_age(&self, age: u8) -> Vec<ClassLevel> {
        classes_for_age(&self.bands, age)
    }

    pub fn lookup_legacy_parent(
        &self,
        phone: &str,
    ) -> Result<Option<LegacyParent>, LegacyLookupError> {
        self.directory.lookup_legacy_parent(phone)
    }

    pub fn legacy_catechumens(
        &self,
        parent_code: &str,
    ) -> Result<Vec<LegacyCatechumen>, LegacyLookupError> {
        self.directory.legacy_catechumens(parent_code)
    }

    /// Suggest a level for `year` from the child's legacy birth data and last attended level.
    ///
    /// The successor of the last level wins when the child's age admits it; otherwise the first
    /// admissible level is proposed. Users may still override through class selection.
    pub fn suggest_class(&self, child: &LegacyCatechumen, year: CatecheticalYear) -> ClassSuggestion {
        let age = match (child.birth_date, year.starts_on()) {
            (Some(birth), Some(start)) => age_from_birthdate(birth, start).ok(),
            _ => child
                .birth_year
                .map(|birth_year| year.start_year - birth_year)
                .and_then(|age| u8::try_from(age).ok()),
        };

        let admissible = age.map(|age| self.classes_for_age(age)).unwrap_or_default();
        let successor = child.last_level.and_then(ClassLevel::next);
        let suggested = successor
            .filter(|level| admissible.contains(level))
            .or_else(|| admissible.first().copied());

        ClassSuggestion {
            age,
            admissible,
            suggested,
        }
    }
}
