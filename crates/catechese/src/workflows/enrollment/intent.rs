use serde::{Deserialize, Serialize};

use crate::workflows::legacy::normalize_label;

/// What a free-text answer asks for, independent of the step it was sent at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    NewEnrollment,
    Reenrollment,
    Confirm,
    Deny,
    Modify,
    Keep,
    Unknown,
}

/// Swappable matching rules for free-text answers.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Intent;
}

/// Accent-insensitive keyword matching on whole words.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

const REENROLLMENT: &[&str] = &["reinscription", "reinscrire", "reinscrit", "ancien"];
const NEW_ENROLLMENT: &[&str] = &["nouvelle", "nouveau", "nouvel", "inscription", "inscrire"];
const DENY: &[&str] = &["non", "no", "incorrect", "faux", "fausse", "erreur", "errone"];
const MODIFY: &[&str] = &["modifier", "modification", "changer", "autre"];
const KEEP: &[&str] = &["inchange", "inchangee", "garder", "identique", "pareil"];
const CONFIRM: &[&str] = &[
    "oui", "ok", "okay", "daccord", "correct", "exact", "valide", "confirme", "confirmer", "yes",
];

impl KeywordClassifier {
    fn words(text: &str) -> Vec<String> {
        let normalized = normalize_label(text).replace("re-", "re").replace("d'accord", "daccord");
        normalized
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Intent {
        let words = Self::words(text);
        let has = |keywords: &[&str]| words.iter().any(|word| keywords.contains(&word.as_str()));

        // Order matters: "réinscription" also contains an enrollment keyword, and a denial
        // usually carries words like "correct".
        if has(REENROLLMENT) {
            Intent::Reenrollment
        } else if has(NEW_ENROLLMENT) {
            Intent::NewEnrollment
        } else if has(DENY) {
            Intent::Deny
        } else if has(MODIFY) {
            Intent::Modify
        } else if has(KEEP) {
            Intent::Keep
        } else if has(CONFIRM) {
            Intent::Confirm
        } else {
            Intent::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_choice_is_accent_and_case_insensitive() {
        let classifier = KeywordClassifier;
        assert_eq!(classifier.classify("réinscription"), Intent::Reenrollment);
        assert_eq!(classifier.classify("RE-INSCRIPTION svp"), Intent::Reenrollment);
        assert_eq!(classifier.classify("Nouvelle inscription"), Intent::NewEnrollment);
    }

    #[test]
    fn denial_wins_over_confirmation_words() {
        let classifier = KeywordClassifier;
        assert_eq!(classifier.classify("Non, ce n'est pas correct"), Intent::Deny);
        assert_eq!(classifier.classify("oui c'est exact"), Intent::Confirm);
        assert_eq!(classifier.classify("D'accord"), Intent::Confirm);
        assert_eq!(classifier.classify("je veux modifier"), Intent::Modify);
        assert_eq!(classifier.classify("inchangé"), Intent::Keep);
    }

    #[test]
    fn words_are_matched_whole() {
        let classifier = KeywordClassifier;
        assert_eq!(classifier.classify("nonne"), Intent::Unknown);
        assert_eq!(classifier.classify("bonjour"), Intent::Unknown);
        assert_eq!(classifier.classify(""), Intent::Unknown);
    }
}
