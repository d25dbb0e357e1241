//! The rule bodies. Each takes already-gathered inputs and returns a verdict; lookups against
//! external collaborators happen in [`crate::engine`].

use chrono::NaiveDate;
use scoap_core::{ArticleAggregate, ArticleFile, RuleOutcome};

use crate::rules::CompliancePolicy;

pub fn license(article: &ArticleAggregate, policy: &CompliancePolicy) -> RuleOutcome {
    let names: Vec<&str> = article.licenses.iter().map(|l| l.name.as_str()).collect();
    if names
        .iter()
        .any(|name| policy.compliant_licenses.iter().any(|ok| ok == name))
    {
        RuleOutcome::pass("License check passed.")
    } else {
        RuleOutcome::fail(format!(
            "Non-compliant licenses: {}. Required: {}.",
            names.join(", "),
            policy.compliant_licenses.join(", ")
        ))
    }
}

pub fn required_file_formats(article: &ArticleAggregate, policy: &CompliancePolicy) -> RuleOutcome {
    let Some(journal_title) = article.first_journal_title() else {
        return RuleOutcome::fail("No publication information found.");
    };
    let available: Vec<String> = article.files.iter().map(file_format).collect();
    let missing: Vec<&str> = policy
        .required_formats_for(journal_title)
        .iter()
        .filter(|format| !available.iter().any(|have| have == *format))
        .map(String::as_str)
        .collect();

    if missing.is_empty() {
        RuleOutcome::pass("All required file formats are present.")
    } else {
        RuleOutcome::fail(format!("Missing required file formats: {}.", missing.join(", ")))
    }
}

/// The stored filetype tag, else the path's extension.
fn file_format(file: &ArticleFile) -> String {
    match &file.filetype {
        Some(kind) => kind.to_ascii_lowercase(),
        None => file
            .file_path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default(),
    }
}

pub fn article_type(article: &ArticleAggregate, policy: &CompliancePolicy) -> RuleOutcome {
    let title = article.article.fields.title.to_lowercase();
    match policy
        .banned_article_types
        .iter()
        .find(|kind| title.contains(&kind.to_lowercase()))
    {
        Some(kind) => RuleOutcome::fail(format!("Article is of non-compliant type: {kind}.")),
        None => RuleOutcome::pass("Article type is compliant."),
    }
}

pub fn arxiv_category(article: &ArticleAggregate, policy: &CompliancePolicy) -> RuleOutcome {
    let partial = article
        .first_journal_title()
        .is_some_and(|title| policy.is_partial_journal(title));
    if !partial {
        return RuleOutcome::pass("ArXiv category compliance not applicable.");
    }

    let compliant = article
        .arxiv_categories
        .iter()
        .any(|c| c.primary && c.category.starts_with(&policy.arxiv_category_prefix));
    if compliant {
        RuleOutcome::pass("ArXiv category is compliant for partial journal.")
    } else {
        RuleOutcome::fail("Primary ArXiv category is not compliant for partial journal.")
    }
}

/// `registered` is `None` when the registry had no date for the DOI or the lookup failed.
pub fn doi_registration_time(
    created: NaiveDate,
    registered: Option<NaiveDate>,
    max_days: i64,
) -> RuleOutcome {
    let Some(registered) = registered else {
        return RuleOutcome::fail("DOI registration date not found.");
    };
    let days = (created - registered).num_days();
    if days > max_days {
        RuleOutcome::fail(format!("DOI registration time exceeded 24 hours. {days} passed."))
    } else {
        RuleOutcome::pass(format!(
            "DOI registration time is within acceptable range. {days} passed."
        ))
    }
}

pub fn missing_doi() -> RuleOutcome {
    RuleOutcome::fail("DOI not found in our system.")
}

pub fn authors_affiliation(article: &ArticleAggregate) -> RuleOutcome {
    let unaffiliated: Vec<String> = article
        .authors
        .iter()
        .filter(|a| a.affiliations.is_empty())
        .map(|a| a.author.full_name().trim().to_string())
        .collect();
    if unaffiliated.is_empty() {
        RuleOutcome::pass("All authors have affiliations.")
    } else {
        RuleOutcome::fail(format!(
            "Authors without affiliations: {}.",
            unaffiliated.join(", ")
        ))
    }
}

/// What scanning one attached file produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileScan {
    Contains,
    Absent,
    Missing(String),
    Unreadable(String),
}

pub fn funded_by_scoap3(scans: &[FileScan], phrase: &str) -> RuleOutcome {
    if scans.is_empty() {
        return RuleOutcome::fail("No files found for the given article.");
    }
    if scans.iter().any(|s| *s == FileScan::Contains) {
        return RuleOutcome::pass(format!("Files contain the required text: '{phrase}'"));
    }

    let mut description = format!("Files do not contain the required text: '{phrase}'");
    let missing: Vec<&str> = scans
        .iter()
        .filter_map(|s| match s {
            FileScan::Missing(path) => Some(path.as_str()),
            _ => None,
        })
        .collect();
    if !missing.is_empty() {
        description.push_str(&format!(". Files not found: {}", missing.join(", ")));
    }
    let unreadable: Vec<&str> = scans
        .iter()
        .filter_map(|s| match s {
            FileScan::Unreadable(path) => Some(path.as_str()),
            _ => None,
        })
        .collect();
    if !unreadable.is_empty() {
        description.push_str(&format!(". Files not readable: {}", unreadable.join(", ")));
    }
    RuleOutcome::fail(description)
}
