//! Free-text to reference-entity resolution: affiliation countries and article licenses.

use std::sync::Arc;

use scoap_core::{Country, LicenseDraft};
use strsim::jaro_winkler;
use tracing::{debug, error, warn};
use url::Url;

use crate::countries::ISO_3166;

/// Placeholder curators leave in affiliation countries that still need a person to look at them.
pub const HUMAN_CHECK: &str = "HUMAN CHECK";
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;

pub const CC_BY_4: (&str, &str) = ("CC-BY-4.0", "https://creativecommons.org/licenses/by/4.0/");
pub const CC_BY_3: (&str, &str) = ("CC-BY-3.0", "https://creativecommons.org/licenses/by/3.0/");

/// Looked up before the catalog, case-insensitively. Research organisations stand in as countries.
const COUNTRY_ALIASES: &[(&str, &str, &str)] = &[
    ("cern", "CERN", "CERN"),
    ("jinr", "JINR", "JINR"),
    ("korea", "KR", "Korea, Republic of"),
    ("niger", "NE", "Niger"),
    ("türkiye", "TR", "Türkiye"),
    ("turkey", "TR", "Türkiye"),
    ("turkiye", "TR", "Türkiye"),
];

/// Sink for resolution misses that a curator should eventually see.
pub trait ErrorTracker: Send + Sync {
    fn capture(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorTracker;

impl ErrorTracker for TracingErrorTracker {
    fn capture(&self, message: &str) {
        error!(target: "scoap::error_tracker", "{message}");
    }
}

#[derive(Clone)]
pub struct CountryResolver {
    tracker: Arc<dyn ErrorTracker>,
    similarity_threshold: f64,
}

impl Default for CountryResolver {
    fn default() -> Self {
        Self::new(Arc::new(TracingErrorTracker))
    }
}

impl CountryResolver {
    pub fn new(tracker: Arc<dyn ErrorTracker>) -> Self {
        Self {
            tracker,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, similarity_threshold: f64) -> Self {
        self.similarity_threshold = similarity_threshold;
        self
    }

    /// Never fails: an unrecognised string yields `None` and is reported to the tracker.
    pub fn resolve(&self, free_text: &str) -> Option<Country> {
        let text = free_text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case(HUMAN_CHECK) {
            return None;
        }

        let key = normalize(text);
        if let Some((_, code, name)) = COUNTRY_ALIASES.iter().find(|(alias, _, _)| *alias == key) {
            return Some(country(code, name));
        }

        if let Some((code, name)) = match_catalog(text, self.similarity_threshold) {
            debug!(input = text, code, "resolved country");
            return Some(country(code, name));
        }

        warn!(input = text, "affiliation country not resolved");
        self.tracker
            .capture(&format!("Country not found for affiliation country {text:?}"));
        None
    }
}

fn country(code: &str, name: &str) -> Country {
    Country {
        code: code.to_string(),
        name: name.to_string(),
    }
}

fn normalize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn names_of(entry: &(&'static str, &'static str, &'static str, &'static str)) -> impl Iterator<Item = &'static str> {
    let (_, _, name, common) = *entry;
    std::iter::once(name).chain((!common.is_empty()).then_some(common))
}

/// Exact code or name, then whole-word containment, then the best fuzzy score above `threshold`.
fn match_catalog(text: &str, threshold: f64) -> Option<(&'static str, &'static str)> {
    let wanted = normalize(text);
    if wanted.is_empty() {
        return None;
    }

    let exact = ISO_3166.iter().find(|entry| {
        let (alpha2, alpha3, _, _) = **entry;
        (text.len() == 2 && text.eq_ignore_ascii_case(alpha2))
            || (text.len() == 3 && text.eq_ignore_ascii_case(alpha3))
            || names_of(entry).any(|name| normalize(name) == wanted)
    });
    if let Some(&(alpha2, _, name, _)) = exact {
        return Some((alpha2, name));
    }

    let padded = format!(" {wanted} ");
    let mut contained: Option<(&'static str, &'static str, usize)> = None;
    for entry in ISO_3166 {
        for candidate in names_of(entry).map(normalize) {
            if candidate.len() < 3 {
                continue;
            }
            if padded.contains(&format!(" {candidate} "))
                && contained.map_or(true, |(_, _, len)| candidate.len() > len)
            {
                contained = Some((entry.0, entry.2, candidate.len()));
            }
        }
    }
    if let Some((alpha2, name, _)) = contained {
        return Some((alpha2, name));
    }

    if wanted.len() >= 4 {
        let mut widest: Option<(&'static str, &'static str, usize)> = None;
        let mut tied = false;
        for entry in ISO_3166 {
            for candidate in names_of(entry).map(normalize) {
                if !format!(" {candidate} ").contains(&padded) {
                    continue;
                }
                match widest {
                    Some((code, _, len)) if candidate.len() == len => tied |= code != entry.0,
                    Some((_, _, len)) if candidate.len() > len => {}
                    _ => {
                        widest = Some((entry.0, entry.2, candidate.len()));
                        tied = false;
                    }
                }
            }
        }
        match widest {
            // Equally short names of two countries: ambiguous, not a match.
            Some(_) if tied => return None,
            Some((alpha2, name, _)) => return Some((alpha2, name)),
            None => {}
        }
    }

    let mut best: Option<(&'static str, &'static str, f64)> = None;
    for entry in ISO_3166 {
        for candidate in names_of(entry).map(normalize) {
            let score = jaro_winkler(&wanted, &candidate);
            if score >= threshold && best.map_or(true, |(_, _, top)| score > top) {
                best = Some((entry.0, entry.2, score));
            }
        }
    }
    best.map(|(alpha2, name, _)| (alpha2, name))
}

/// Natural key of a license row after canonicalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseKey {
    pub url: String,
    pub name: String,
}

/// `None` when the entry carries neither a usable URL nor a name.
pub fn normalize_license(entry: &LicenseDraft) -> Option<LicenseKey> {
    let name = entry
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let url = entry
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .filter(|u| {
            let valid = is_web_url(u);
            if !valid {
                debug!(url = u, "dropping invalid license url");
            }
            valid
        });

    let canonical = name
        .and_then(canonical_cc_by)
        .or_else(|| url.and_then(canonical_cc_by));
    if let Some((name, url)) = canonical {
        return Some(LicenseKey {
            url: url.to_string(),
            name: name.to_string(),
        });
    }

    match (url, name) {
        (None, None) => None,
        (url, name) => Some(LicenseKey {
            url: url.unwrap_or_default().to_string(),
            name: name.unwrap_or_default().to_string(),
        }),
    }
}

fn is_web_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

/// Maps the spellings of CC BY 4.0 and 3.0 seen in the wild (names, deeds, legal-code URLs) to one form.
fn canonical_cc_by(text: &str) -> Option<(&'static str, &'static str)> {
    let compact: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '.')
        .collect();
    let compact = compact.trim_end_matches("legalcode").trim_end_matches("deed.en");
    [("4.0", CC_BY_4), ("3.0", CC_BY_3)]
        .into_iter()
        .find(|(version, _)| {
            compact == format!("ccby{version}")
                || compact.ends_with(&format!("creativecommons.orglicensesby{version}"))
                || compact.starts_with(&format!("creativecommonsattribution{version}"))
        })
        .map(|(_, canonical)| canonical)
}
