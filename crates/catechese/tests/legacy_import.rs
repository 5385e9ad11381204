use std::io::Cursor;

use chrono::NaiveDate;
use catechese::workflows::enrollment::{CatecheticalYear, ClassLevel, EligibilityResolver};
use catechese::workflows::legacy::{LegacyDirectory, LegacyImportError, LegacyImporter};
use std::sync::Arc;

const HEADER: &str = "Code Parent,Nom Parent,Prenom Parent,Telephone,Code Enfant,Nom,Prenoms,Date Naissance,Annee Naissance,Niveau\n";

#[test]
fn register_export_is_indexed_by_phone() {
    let csv = format!(
        "{HEADER}\
P100,OUEDRAOGO,Issa,+226 70 00 11 22,E200,OUEDRAOGO,Salif,2015-11-02,,3eme annee\n\
P100,OUEDRAOGO,Issa,+226 70 00 11 22,E201,OUEDRAOGO,Aminata,,2013,Premiere communion\n\
P100,OUEDRAOGO,Issa,+226 70 00 11 22,E200,OUEDRAOGO,Salif,2015-11-02,,3eme annee\n\
P101,SOME,Clarisse,65 43 21 00,,,,,,\n"
    );

    let directory = LegacyImporter::from_reader(Cursor::new(csv)).expect("import succeeds");
    assert_eq!(directory.parent_count(), 2);
    assert_eq!(directory.catechumen_count(), 2);

    let parent = directory
        .lookup_legacy_parent("70001122")
        .expect("lookup")
        .expect("parent known by local number");
    assert_eq!(parent.code, "P100");
    assert_eq!(parent.phone, "22670001122");

    let children = directory.legacy_catechumens("P100").expect("children");
    let salif = children
        .iter()
        .find(|child| child.code == "E200")
        .expect("Salif imported");
    assert_eq!(salif.last_level, Some(ClassLevel::Cm1));
    assert_eq!(salif.birth_date, NaiveDate::from_ymd_opt(2015, 11, 2));
    assert_eq!(salif.display_name(), "OUEDRAOGO Salif");

    let aminata = children
        .iter()
        .find(|child| child.code == "E201")
        .expect("Aminata imported");
    assert_eq!(aminata.birth_date, None);
    assert_eq!(aminata.birth_year, Some(2013));
    assert_eq!(aminata.last_level, Some(ClassLevel::Cm2));
}

#[test]
fn imported_children_get_class_suggestions() {
    let csv = format!(
        "{HEADER}P100,OUEDRAOGO,Issa,70001122,E200,OUEDRAOGO,Salif,02/11/2015,,3eme annee\n"
    );
    let directory = Arc::new(LegacyImporter::from_reader(Cursor::new(csv)).expect("import"));
    let resolver = EligibilityResolver::new(directory.clone());

    let children = directory.legacy_catechumens("P100").expect("children");
    let suggestion = resolver.suggest_class(&children[0], CatecheticalYear { start_year: 2025 });
    assert_eq!(suggestion.age, Some(9));
    assert_eq!(suggestion.suggested, Some(ClassLevel::Cm2));
}

#[test]
fn rows_missing_required_columns_fail_the_import() {
    let csv = "Code Parent,Telephone\nP100,70001122\n";
    match LegacyImporter::from_reader(Cursor::new(csv)) {
        Err(LegacyImportError::Csv(_)) => {}
        other => panic!("expected csv error, got {other:?}"),
    }
}
