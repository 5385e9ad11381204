use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Mobile-money operators, identified by the prefix of their transaction references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OrangeMoney,
    MoovMoney,
    Wave,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OrangeMoney, Provider::MoovMoney, Provider::Wave];

    pub const fn code(self) -> &'static str {
        match self {
            Provider::OrangeMoney => "OM",
            Provider::MoovMoney => "MV",
            Provider::Wave => "WV",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Provider::OrangeMoney => "Orange Money",
            Provider::MoovMoney => "Moov Money",
            Provider::Wave => "Wave",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|provider| provider.code().eq_ignore_ascii_case(code))
    }

    /// Match a provider name as printed on a receipt.
    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.to_lowercase();
        if lowered.contains("orange") {
            Some(Provider::OrangeMoney)
        } else if lowered.contains("moov") {
            Some(Provider::MoovMoney)
        } else if lowered.contains("wave") {
            Some(Provider::Wave)
        } else {
            None
        }
    }

    fn pattern(self) -> &'static Regex {
        static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
        let patterns = PATTERNS.get_or_init(|| {
            Provider::ALL.map(|provider| {
                Regex::new(&format!(r"^{}\d{{8,15}}$", provider.code()))
                    .expect("provider reference pattern compiles")
            })
        });
        &patterns[self as usize]
    }
}

/// Uppercase and strip whitespace so `om 1234 5678` compares like `OM12345678`.
pub fn normalize_reference(reference: &str) -> String {
    reference
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Whether `reference` is `{PROVIDER_CODE}{8-15 digits}` for `provider`. Total over any input.
pub fn is_valid_reference(reference: &str, provider: Provider) -> bool {
    provider.pattern().is_match(&normalize_reference(reference))
}

/// First provider whose format the reference satisfies.
pub fn detect_provider(reference: &str) -> Option<Provider> {
    Provider::ALL
        .into_iter()
        .find(|provider| is_valid_reference(reference, *provider))
}
