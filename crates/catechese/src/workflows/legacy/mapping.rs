use super::normalizer::normalize_label;
use crate::workflows::enrollment::domain::ClassLevel;
use std::collections::HashMap;
use std::sync::OnceLock;

static LEGACY_LEVEL_MAP: OnceLock<HashMap<String, ClassLevel>> = OnceLock::new();

/// Map a level label from the historical register onto the current curriculum.
pub(crate) fn level_for_label(label: &str) -> Option<ClassLevel> {
    let normalized = normalize_label(label);
    if normalized.is_empty() {
        return None;
    }
    legacy_level_map()
        .get(&normalized)
        .copied()
        .or_else(|| ClassLevel::parse(&normalized))
}

fn legacy_level_map() -> &'static HashMap<String, ClassLevel> {
    LEGACY_LEVEL_MAP.get_or_init(|| {
        const LABEL_TO_LEVEL: &[(&str, ClassLevel)] = &[
            ("eveil a la foi", ClassLevel::Eveil),
            ("eveil religieux", ClassLevel::Eveil),
            ("jardin", ClassLevel::Eveil),
            ("1ere annee", ClassLevel::Ce1),
            ("premiere annee", ClassLevel::Ce1),
            ("2eme annee", ClassLevel::Ce2),
            ("deuxieme annee", ClassLevel::Ce2),
            ("3eme annee", ClassLevel::Cm1),
            ("troisieme annee", ClassLevel::Cm1),
            ("4eme annee", ClassLevel::Cm2),
            ("quatrieme annee", ClassLevel::Cm2),
            ("premiere communion", ClassLevel::Cm2),
            ("confirmands", ClassLevel::Confirmation),
            ("preparation confirmation", ClassLevel::Confirmation),
        ];

        LABEL_TO_LEVEL
            .iter()
            .map(|(label, level)| (normalize_label(label), *level))
            .collect()
    })
}
