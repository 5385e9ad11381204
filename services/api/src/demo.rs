use crate::infra::{build_service, load_legacy_directory, LogNotifier};
use async_trait::async_trait;
use catechese::config::EnrollmentConfig;
use catechese::error::AppError;
use catechese::workflows::enrollment::{
    CatecheticalYear, Channel, Clock, DocumentFormat, EligibilityResolver,
    EnrollmentWorkflowService, OcrEngine, OcrError, OcrToken, Step, TreasurerAction, UserId,
    UserInput,
};
use catechese::workflows::legacy::{InMemoryLegacyDirectory, LegacyDirectory, LegacyImporter};
use chrono::{DateTime, Local, NaiveDate, NaiveTime, Utc};
use clap::Args;
use serde::Serialize;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

const SAMPLE_REGISTER: &str = "Code Parent,Nom Parent,Prenom Parent,Telephone,Code Enfant,Nom,Prenoms,Date Naissance,Annee Naissance,Niveau\n\
P001,KABORE,Jean,+226 70 11 22 33,E001,KABORE,Paul,12/03/2016,,1ere annee\n\
P001,KABORE,Jean,+226 70 11 22 33,E002,KABORE,Awa,,2012,Premiere communion\n";

const SAMPLE_CERTIFICATE: &str =
    "ACTE DE NAISSANCE N° 0457\nNom : OUEDRAOGO\nPrénoms : Paul Joseph\nNé le 12/03/2016 à Ouagadougou";

/// Smallest JPEG header the format sniffer recognises.
const SAMPLE_SCAN: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Date the conversations take place on (YYYY-MM-DD). Defaults to today.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
    /// Historical register export; a two-child sample register is used otherwise.
    #[arg(long)]
    pub(crate) legacy_csv: Option<PathBuf>,
    /// Birth certificate scan to upload instead of the built-in sample.
    #[arg(long)]
    pub(crate) certificate: Option<PathBuf>,
    /// Print the transcript as JSON.
    #[arg(long)]
    pub(crate) json: bool,
}

#[derive(Args, Debug)]
pub(crate) struct LegacyLookupArgs {
    /// Historical register export
    #[arg(long)]
    pub(crate) csv: PathBuf,
    /// Parent phone number, in any common format
    #[arg(long)]
    pub(crate) phone: String,
    /// Reference date for ages and the catechetical year (defaults to today)
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Speaker {
    Parent,
    Assistant,
    Treasurer,
    System,
}

#[derive(Debug, Clone, Serialize)]
struct TranscriptLine {
    conversation: &'static str,
    speaker: Speaker,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<Step>,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    options: Vec<String>,
}

#[derive(Default)]
struct Transcript {
    lines: Vec<TranscriptLine>,
}

impl Transcript {
    fn push(&mut self, conversation: &'static str, speaker: Speaker, text: impl Into<String>) {
        self.lines.push(TranscriptLine {
            conversation,
            speaker,
            step: None,
            text: text.into(),
            options: Vec::new(),
        });
    }

    fn reply(&mut self, conversation: &'static str, step: Step, text: &str, options: &[String]) {
        self.lines.push(TranscriptLine {
            conversation,
            speaker: Speaker::Assistant,
            step: Some(step),
            text: text.to_string(),
            options: options.to_vec(),
        });
    }

    fn render(&self) {
        let mut current = "";
        for line in &self.lines {
            if line.conversation != current {
                current = line.conversation;
                println!("\n== {current} ==");
            }
            let who = match line.speaker {
                Speaker::Parent => "parent",
                Speaker::Assistant => "assistant",
                Speaker::Treasurer => "treasurer",
                Speaker::System => "system",
            };
            match line.step {
                Some(step) => println!("[{who} @ {step}] {}", line.text),
                None => println!("[{who}] {}", line.text),
            }
            for (index, option) in line.options.iter().enumerate() {
                println!("    {}. {option}", index + 1);
            }
        }
    }
}

/// Answers every upload with the same certificate text.
struct CannedOcr;

#[async_trait]
impl OcrEngine for CannedOcr {
    async fn recognize(&self, image: &[u8]) -> Result<Vec<OcrToken>, OcrError> {
        if image.is_empty() {
            return Err(OcrError::UnreadableImage("empty upload".to_string()));
        }
        Ok(SAMPLE_CERTIFICATE
            .lines()
            .map(|line| OcrToken::new(line, 0.93))
            .collect())
    }
}

struct DemoClock(DateTime<Utc>);

impl Clock for DemoClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

enum Turn {
    Say(&'static str),
    Upload,
}

struct Scan {
    bytes: Vec<u8>,
    format: DocumentFormat,
}

fn load_scan(path: Option<PathBuf>) -> Result<Scan, AppError> {
    let Some(path) = path else {
        return Ok(Scan {
            bytes: SAMPLE_SCAN.to_vec(),
            format: DocumentFormat::Jpeg,
        });
    };
    let bytes = std::fs::read(&path)?;
    let format = mime_guess::from_path(&path)
        .first()
        .map(|mime| DocumentFormat::from_mime(&mime))
        .unwrap_or(DocumentFormat::Unknown);
    Ok(Scan { bytes, format })
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        today,
        legacy_csv,
        certificate,
        json,
    } = args;

    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let legacy = match legacy_csv {
        Some(path) => load_legacy_directory(Some(path.as_path()))?,
        None => LegacyImporter::from_reader(Cursor::new(SAMPLE_REGISTER))?,
    };
    let scan = load_scan(certificate)?;

    let config = EnrollmentConfig::default();
    let service = build_service(
        &config,
        Arc::new(legacy),
        Arc::new(CannedOcr),
        Arc::new(LogNotifier),
    )
    .with_clock(Arc::new(DemoClock(today.and_time(NaiveTime::MIN).and_utc())));

    let mut transcript = Transcript::default();
    transcript.push(
        "setup",
        Speaker::System,
        format!(
            "catechetical year {} / fee {} {}",
            CatecheticalYear::upcoming(today),
            config.fee,
            config.currency
        ),
    );

    converse(
        &service,
        &mut transcript,
        "new enrollment",
        "demo-ouedraogo",
        "+226 76 00 00 01",
        &[
            Turn::Say("1"),
            Turn::Upload,
            Turn::Say("1"),
            Turn::Say("OUEDRAOGO; Mariam; 76 00 00 01"),
            Turn::Say("OK"),
            Turn::Say("oui"),
            Turn::Say("1"),
            Turn::Say("OM 1234 5678"),
        ],
        &scan,
    )
    .await?;
    review_queue(&service, &mut transcript, "new enrollment").await?;

    converse(
        &service,
        &mut transcript,
        "re-enrollment",
        "demo-kabore",
        "+226 70 11 22 33",
        &[
            Turn::Say("réinscription"),
            Turn::Say("1"),
            Turn::Say("oui"),
            Turn::Say("WV 5566 7788"),
        ],
        &scan,
    )
    .await?;
    review_queue(&service, &mut transcript, "re-enrollment").await?;

    let report = service.run_maintenance().await?;
    transcript.push(
        "maintenance",
        Speaker::System,
        format!(
            "{} payment(s) expired, {} idle session(s) purged",
            report.expired_payments, report.purged_sessions
        ),
    );

    if json {
        match serde_json::to_string_pretty(&transcript.lines) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => tracing::warn!(error = %err, "transcript could not be serialized"),
        }
    } else {
        println!("Catechism enrollment demo");
        transcript.render();
    }

    Ok(())
}

async fn converse(
    service: &EnrollmentWorkflowService,
    transcript: &mut Transcript,
    conversation: &'static str,
    user: &str,
    phone: &str,
    turns: &[Turn],
    scan: &Scan,
) -> Result<(), AppError> {
    let user_id = UserId::from(user);
    let reply = service
        .start_workflow(&user_id, phone, Channel::Whatsapp)
        .await?;
    transcript.reply(conversation, reply.step, &reply.message, &reply.options);

    for turn in turns {
        let input = match turn {
            Turn::Say(text) => {
                transcript.push(conversation, Speaker::Parent, *text);
                UserInput::text(*text)
            }
            Turn::Upload => {
                transcript.push(
                    conversation,
                    Speaker::Parent,
                    format!("<{} scan, {} bytes>", scan.format.extension(), scan.bytes.len()),
                );
                UserInput::attachment(scan.bytes.clone(), scan.format)
            }
        };

        let reply = service.process_input(&user_id, input).await?;
        transcript.reply(conversation, reply.step, &reply.message, &reply.options);
        if reply.step.is_parked() {
            break;
        }
    }

    Ok(())
}

async fn review_queue(
    service: &EnrollmentWorkflowService,
    transcript: &mut Transcript,
    conversation: &'static str,
) -> Result<(), AppError> {
    for validation in service.treasurer_queue(10)? {
        let Some(reviewer) = validation.assigned_to.clone() else {
            continue;
        };
        service.claim_validation(&validation.id, &reviewer)?;
        let outcome = service
            .decide_payment(&validation.id, &reviewer, TreasurerAction::Approve, None)
            .await?;
        transcript.push(
            conversation,
            Speaker::Treasurer,
            format!(
                "{reviewer} approved {} for {} ({}): enrollment {}",
                outcome.payment.reference,
                outcome.enrollment.child.first_names,
                outcome.enrollment.level.label(),
                outcome.enrollment.status.label()
            ),
        );
    }
    Ok(())
}

pub(crate) fn run_legacy_lookup(args: LegacyLookupArgs) -> Result<(), AppError> {
    let LegacyLookupArgs { csv, phone, today } = args;
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let directory: Arc<InMemoryLegacyDirectory> = Arc::new(LegacyImporter::from_path(&csv)?);

    let Some(parent) = directory.lookup_legacy_parent(&phone)? else {
        println!("No parent registered for {phone}");
        return Ok(());
    };

    let year = CatecheticalYear::upcoming(today);
    let resolver = EligibilityResolver::new(directory.clone());
    println!(
        "{} {} ({}) - phone {}",
        parent.last_name, parent.first_name, parent.code, parent.phone
    );

    let children = directory.legacy_catechumens(&parent.code)?;
    if children.is_empty() {
        println!("  no catechumen on record");
    }
    for child in children {
        let suggestion = resolver.suggest_class(&child, year);
        let last = child.last_level.map(|level| level.label()).unwrap_or("?");
        let age = suggestion
            .age
            .map(|age| format!("{age} ans"))
            .unwrap_or_else(|| "age inconnu".to_string());
        let suggested = suggestion
            .suggested
            .map(|level| level.label())
            .unwrap_or("aucune classe");
        println!(
            "  {} - {age}, dernier niveau {last} -> {suggested} en {year}",
            child.display_name()
        );
    }

    Ok(())
}
