//! User-facing French texts. Kept apart from the step logic so wording changes stay local.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::domain::{CatecheticalYear, ChildInfo, ClassLevel, ParentInfo};
use super::eligibility::ClassSuggestion;
use super::payment::provider::Provider;
use crate::workflows::legacy::{LegacyCatechumen, LegacyParent};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub message: String,
    pub options: Vec<String>,
}

impl Prompt {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            options: Vec::new(),
        }
    }

    pub fn with_options(message: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            message: message.into(),
            options,
        }
    }

    /// Put `notice` above the prompt, e.g. the reason an input was refused.
    pub fn preceded_by(mut self, notice: &str) -> Self {
        self.message = format!("{notice}\n\n{}", self.message);
        self
    }
}

fn numbered(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| format!("{}. {}", index + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

fn amount(value: u32) -> String {
    let digits = value.to_string();
    let mut grouped = String::new();
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(digit);
    }
    grouped
}

pub fn fee_label(fee: u32, currency: &str) -> String {
    format!("{} {}", amount(fee), currency)
}

pub fn initial_choice() -> Prompt {
    let options = vec![
        "Nouvelle inscription".to_string(),
        "Réinscription".to_string(),
    ];
    Prompt::with_options(
        format!(
            "Bienvenue au service d'inscription au catéchisme de la paroisse.\nQue souhaitez-vous faire ?\n{}",
            numbered(&options)
        ),
        options,
    )
}

pub fn reenrollment_select(parent: &LegacyParent, children: &[LegacyCatechumen]) -> Prompt {
    let options: Vec<String> = children
        .iter()
        .map(|child| match child.last_level {
            Some(level) => format!("{} (dernier niveau : {})", child.display_name(), level.label()),
            None => child.display_name(),
        })
        .collect();
    Prompt::with_options(
        format!(
            "Bonjour {} {}. Voici les enfants déjà inscrits dans nos registres :\n{}\nRépondez par le numéro de l'enfant à réinscrire.",
            parent.first_name,
            parent.last_name.to_uppercase(),
            numbered(&options)
        ),
        options,
    )
}

pub fn reenrollment_confirm(
    child: &LegacyCatechumen,
    suggestion: &ClassSuggestion,
    year: CatecheticalYear,
) -> Prompt {
    let options = vec!["Oui".to_string(), "Modifier".to_string()];
    let message = match suggestion.suggested {
        Some(level) => format!(
            "Pour l'année {}, nous proposons d'inscrire {} en {}.\nConfirmez-vous ? (Oui / Modifier)",
            year,
            child.display_name(),
            level.label()
        ),
        None => format!(
            "Nous n'avons pas pu proposer de niveau pour {} en {}. Répondez « Modifier » pour choisir le niveau.",
            child.display_name(),
            year
        ),
    };
    Prompt::with_options(message, options)
}

pub fn unknown_parent() -> &'static str {
    "Nous n'avons pas retrouvé votre numéro dans nos registres. Nous allons procéder à une nouvelle inscription."
}

pub fn age_verification() -> Prompt {
    Prompt::text(
        "Merci d'envoyer une photo lisible de l'acte de naissance de l'enfant. Nous l'utilisons pour vérifier son âge.",
    )
}

pub fn class_selection(levels: &[ClassLevel], age: Option<u8>) -> Prompt {
    let options: Vec<String> = levels.iter().map(|level| level.label().to_string()).collect();
    let header = match age {
        Some(age) => format!("L'enfant a {age} ans. Les niveaux possibles sont :"),
        None => "Choisissez le niveau de l'enfant :".to_string(),
    };
    Prompt::with_options(
        format!(
            "{header}\n{}\nRépondez par le numéro du niveau.",
            numbered(&options)
        ),
        options,
    )
}

pub fn parent_info(legacy: Option<&LegacyParent>) -> Prompt {
    let format = "Nom; Prénom; Téléphone; Email (facultatif)";
    match legacy {
        Some(parent) => Prompt::with_options(
            format!(
                "Nous avons ces informations pour le parent : {} {}, {}.\nRépondez « OK » si elles sont à jour, sinon envoyez : {format}",
                parent.last_name.to_uppercase(),
                parent.first_name,
                parent.phone
            ),
            vec!["OK".to_string()],
        ),
        None => Prompt::text(format!(
            "Envoyez les informations du parent sous la forme : {format}"
        )),
    }
}

pub fn child_info(prefill: Option<&ChildInfo>) -> Prompt {
    let format = "Nom; Prénoms; JJ/MM/AAAA; Lieu de naissance";
    match prefill {
        Some(child) => Prompt::with_options(
            format!(
                "Informations de l'enfant : {}, né(e) le {} à {}.\nRépondez « OK » si elles sont exactes, sinon envoyez : {format}",
                child.display_name(),
                child.birth_date.format("%d/%m/%Y"),
                child.birth_place
            ),
            vec!["OK".to_string()],
        ),
        None => Prompt::text(format!(
            "Envoyez les informations de l'enfant sous la forme : {format}"
        )),
    }
}

pub fn confirm_data(parent: &ParentInfo, child: &ChildInfo, level: ClassLevel) -> Prompt {
    let mut summary = format!(
        "Récapitulatif :\n- Parent : {} ({})\n- Enfant : {}, né(e) le {} à {}\n- Niveau : {}",
        parent.display_name(),
        parent.phone,
        child.display_name(),
        child.birth_date.format("%d/%m/%Y"),
        child.birth_place,
        level.label()
    );
    if let Some(email) = &parent.email {
        summary.push_str(&format!("\n- Email : {email}"));
    }
    Prompt::with_options(
        format!("{summary}\nCes informations sont-elles correctes ? (Oui / Non)"),
        vec!["Oui".to_string(), "Non".to_string()],
    )
}

pub fn year_selection(years: &[CatecheticalYear]) -> Prompt {
    let options: Vec<String> = years.iter().map(|year| year.label()).collect();
    Prompt::with_options(
        format!(
            "Pour quelle année catéchétique inscrivez-vous l'enfant ?\n{}",
            numbered(&options)
        ),
        options,
    )
}

pub fn payment_proof(fee: u32, currency: &str, providers: &[Provider]) -> Prompt {
    let names: Vec<String> = providers
        .iter()
        .map(|provider| format!("{} ({})", provider.display_name(), provider.code()))
        .collect();
    Prompt::text(format!(
        "Les frais d'inscription sont de {}. Payez par {} puis envoyez la capture du reçu ou la référence de la transaction (ex. {}12345678).",
        fee_label(fee, currency),
        names.join(", "),
        providers.first().map(|provider| provider.code()).unwrap_or("OM")
    ))
}

pub fn treasurer_waiting(number: &str) -> Prompt {
    Prompt::text(format!(
        "Merci ! Votre dossier {number} est enregistré. Le trésorier va vérifier votre paiement ; vous recevrez un message dès sa décision."
    ))
}

pub fn still_waiting(number: &str) -> Prompt {
    Prompt::text(format!(
        "Votre paiement pour le dossier {number} est en cours de vérification par le trésorier. Merci de patienter."
    ))
}

pub fn supplement_received() -> Prompt {
    Prompt::text("Merci, votre complément a été transmis au trésorier.")
}

pub fn completed(number: &str) -> Prompt {
    Prompt::text(format!(
        "L'inscription {number} est validée. Bienvenue au catéchisme !"
    ))
}

pub fn pending_human() -> Prompt {
    Prompt::text(
        "Votre dossier a été transmis à un responsable de la paroisse qui vous recontactera rapidement.",
    )
}

pub fn apology() -> &'static str {
    "Désolé, une erreur est survenue pendant le traitement de votre demande."
}

pub fn too_many_attempts() -> &'static str {
    "Nous n'arrivons pas à traiter vos réponses."
}

pub fn invalid_choice() -> &'static str {
    "Réponse non reconnue. Merci de répondre par le numéro d'une des options proposées."
}

pub fn expected_text() -> &'static str {
    "Merci de répondre par un message texte."
}

pub fn expected_document() -> &'static str {
    "Nous attendons une photo du document, pas un message texte."
}

pub fn document_unreadable() -> &'static str {
    "Nous n'avons pas pu lire le document envoyé."
}

pub fn document_needs_review() -> &'static str {
    "Le document envoyé doit être vérifié par un responsable."
}

pub fn no_class_for_age(age: u8) -> String {
    format!("Aucun niveau de catéchisme ne correspond à l'âge de l'enfant ({age} ans).")
}

pub fn invalid_parent_info() -> &'static str {
    "Format non reconnu. Exemple : OUEDRAOGO; Marie; 70112233; marie@exemple.com"
}

pub fn invalid_child_info() -> &'static str {
    "Format non reconnu. Exemple : OUEDRAOGO; Paul Joseph; 12/03/2016; Ouagadougou"
}

pub fn invalid_birth_date() -> &'static str {
    "La date de naissance indiquée n'est pas valide."
}

pub fn birth_date_mismatch(verified: NaiveDate) -> String {
    format!(
        "La date de naissance ne correspond pas à celle de l'acte de naissance ({}).",
        verified.format("%d/%m/%Y")
    )
}

pub fn age_outside_level(age: u8, level: ClassLevel) -> String {
    format!(
        "Un enfant de {age} ans ne peut pas être inscrit en {}.",
        level.label()
    )
}

pub fn summary_rejected() -> &'static str {
    "Un responsable va reprendre les informations avec vous."
}

pub fn invalid_reference() -> &'static str {
    "Référence non reconnue. Elle commence par le code de l'opérateur suivi de 8 à 15 chiffres (ex. OM12345678)."
}

pub fn provider_not_accepted(name: &str) -> String {
    format!("Les paiements par {name} ne sont pas acceptés pour les inscriptions.")
}

pub fn receipt_unreadable() -> &'static str {
    "Le reçu n'a pas pu être lu. Envoyez plutôt la référence de la transaction par message."
}

pub fn fee_mismatch(expected: u32, found: u32, currency: &str) -> String {
    format!(
        "Le montant du reçu ({}) ne correspond pas aux frais d'inscription ({}).",
        fee_label(found, currency),
        fee_label(expected, currency)
    )
}

pub fn receipt_from_future() -> &'static str {
    "La date du reçu est dans le futur. Vérifiez le reçu envoyé."
}

pub fn reference_already_used(reference: &str) -> String {
    format!("La référence {reference} a déjà été utilisée pour une inscription.")
}

pub fn duplicate_enrollment(number: &str) -> String {
    format!("Cet enfant est déjà inscrit pour cette année (dossier {number}).")
}

pub fn payment_approved(number: &str) -> String {
    format!("Bonne nouvelle : le paiement du dossier {number} est validé. L'inscription est active.")
}

pub fn payment_rejected(number: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!(
            "Le paiement du dossier {number} a été refusé : {reason}. Vous pouvez envoyer un nouveau reçu ou une nouvelle référence."
        ),
        None => format!(
            "Le paiement du dossier {number} a été refusé. Vous pouvez envoyer un nouveau reçu ou une nouvelle référence."
        ),
    }
}

pub fn payment_needs_info(number: &str, request: Option<&str>) -> String {
    format!(
        "Le trésorier a besoin d'informations complémentaires pour le dossier {number}{}. Répondez directement à ce message.",
        request.map(|text| format!(" : {text}")).unwrap_or_default()
    )
}

pub fn payment_escalated(number: &str) -> String {
    format!("Le paiement du dossier {number} est transmis à un autre responsable pour vérification.")
}

pub fn payment_expired(reference: &str) -> String {
    format!(
        "Le paiement {reference} n'a pas pu être vérifié à temps et a expiré. Envoyez une nouvelle preuve de paiement pour reprendre le dossier."
    )
}

pub fn enrollment_cancelled(number: &str) -> String {
    format!("L'inscription {number} a été annulée.")
}

pub fn reviewer_new_validation(number: &str, reference: &str, amount: u32, currency: &str) -> String {
    format!(
        "Nouveau paiement à vérifier : dossier {number}, référence {reference}, montant {}.",
        fee_label(amount, currency)
    )
}

pub fn reviewer_supplement(number: &str, text: &str) -> String {
    format!("Complément reçu pour le dossier {number} : {text}")
}

pub fn operators_escalation(user: &str, step: &str, reason: &str) -> String {
    format!("Conversation {user} transmise à un responsable à l'étape {step} : {reason}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_are_grouped_by_thousands() {
        assert_eq!(fee_label(10000, "FCFA"), "10 000 FCFA");
        assert_eq!(fee_label(500, "FCFA"), "500 FCFA");
        assert_eq!(fee_label(1250000, "FCFA"), "1 250 000 FCFA");
    }

    #[test]
    fn numbered_options_are_listed_in_the_message() {
        let prompt = year_selection(&[
            CatecheticalYear { start_year: 2025 },
            CatecheticalYear { start_year: 2026 },
        ]);
        assert!(prompt.message.contains("1. 2025-2026"));
        assert!(prompt.message.contains("2. 2026-2027"));
        assert_eq!(prompt.options, vec!["2025-2026", "2026-2027"]);
    }
}
