//! Canonical article model and the adapter -> importer handoff contract.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "scoap-core";

pub type ArticleId = i64;

pub const ORCID: &str = "ORCID";
pub const ROR: &str = "ROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentifierType {
    #[serde(rename = "DOI")]
    Doi,
    #[serde(rename = "arXiv")]
    Arxiv,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Doi => "DOI",
            Self::Arxiv => "arXiv",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("doi") {
            Some(Self::Doi)
        } else if value.eq_ignore_ascii_case("arxiv") {
            Some(Self::Arxiv)
        } else {
            None
        }
    }
}

/// Mutable descriptive fields of an article, shared by create and update paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleFields {
    pub reception_date: Option<NaiveDate>,
    pub acceptance_date: Option<NaiveDate>,
    pub publication_date: Option<NaiveDate>,
    pub first_online_date: Option<NaiveDate>,
    pub title: String,
    pub subtitle: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    #[serde(flatten)]
    pub fields: ArticleFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert request. `id: None` means "allocate from the article sequence".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub id: Option<ArticleId>,
    pub fields: ArticleFields,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleIdentifier {
    pub id: i64,
    pub article_id: ArticleId,
    pub identifier_type: IdentifierType,
    pub identifier_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleFile {
    pub id: i64,
    pub article_id: ArticleId,
    pub file_path: String,
    pub filetype: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyrightFields {
    pub statement: String,
    pub holder: String,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Copyright {
    pub id: i64,
    pub article_id: ArticleId,
    #[serde(flatten)]
    pub fields: CopyrightFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArxivCategory {
    pub id: i64,
    pub article_id: ArticleId,
    pub category: String,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationInfoFields {
    pub journal_title: String,
    pub journal_volume: String,
    pub journal_issue: String,
    pub page_start: String,
    pub page_end: String,
    pub artid: String,
    pub volume_year: Option<String>,
    pub journal_issue_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationInfo {
    pub id: i64,
    pub article_id: ArticleId,
    pub publisher_id: i64,
    #[serde(flatten)]
    pub fields: PublicationInfoFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub id: i64,
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub article_id: ArticleId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub author_order: i32,
}

impl Author {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Natural key of an author row; every field participates in get-or-create.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewAuthor {
    pub article_id: ArticleId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub author_order: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorIdentifier {
    pub id: i64,
    pub author_id: i64,
    pub identifier_type: String,
    pub identifier_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affiliation {
    pub id: i64,
    pub value: String,
    pub organization: String,
    pub country_code: Option<String>,
}

/// Natural key of a shared affiliation row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewAffiliation {
    pub value: String,
    pub organization: String,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstitutionIdentifier {
    pub id: i64,
    pub affiliation_id: i64,
    pub identifier_type: String,
    pub identifier_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentalCollaboration {
    pub id: i64,
    pub name: String,
}

/// Verdict of a single compliance rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub passed: bool,
    pub description: String,
}

impl RuleOutcome {
    pub fn pass(description: impl Into<String>) -> Self {
        Self {
            passed: true,
            description: description.into(),
        }
    }

    pub fn fail(description: impl Into<String>) -> Self {
        Self {
            passed: false,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceChecks {
    pub license: RuleOutcome,
    pub required_file_formats: RuleOutcome,
    pub article_type: RuleOutcome,
    pub arxiv_category: RuleOutcome,
    pub doi_registration_time: RuleOutcome,
    pub authors_affiliation: RuleOutcome,
    pub funded_by_scoap3: RuleOutcome,
}

impl ComplianceChecks {
    pub fn named(&self) -> [(&'static str, &RuleOutcome); 7] {
        [
            ("license", &self.license),
            ("required_file_formats", &self.required_file_formats),
            ("article_type", &self.article_type),
            ("arxiv_category", &self.arxiv_category),
            ("doi_registration_time", &self.doi_registration_time),
            ("authors_affiliation", &self.authors_affiliation),
            ("funded_by_scoap3", &self.funded_by_scoap3),
        ]
    }

    pub fn all_passed(&self) -> bool {
        self.named().iter().all(|(_, outcome)| outcome.passed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub id: i64,
    pub article_id: ArticleId,
    pub report_date: DateTime<Utc>,
    pub checks: ComplianceChecks,
    pub compliant: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComplianceReport {
    pub article_id: ArticleId,
    pub report_date: DateTime<Utc>,
    pub checks: ComplianceChecks,
}

impl NewComplianceReport {
    pub fn compliant(&self) -> bool {
        self.checks.all_passed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationInfoView {
    #[serde(flatten)]
    pub info: PublicationInfo,
    pub publisher: Publisher,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationView {
    #[serde(flatten)]
    pub affiliation: Affiliation,
    pub country: Option<Country>,
    pub institution_identifiers: Vec<InstitutionIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorView {
    #[serde(flatten)]
    pub author: Author,
    pub identifiers: Vec<AuthorIdentifier>,
    pub affiliations: Vec<AffiliationView>,
}

/// Fully loaded article: the representation returned by imports and read by the rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleAggregate {
    #[serde(flatten)]
    pub article: Article,
    pub identifiers: Vec<ArticleIdentifier>,
    pub files: Vec<ArticleFile>,
    pub licenses: Vec<License>,
    pub copyrights: Vec<Copyright>,
    pub arxiv_categories: Vec<ArxivCategory>,
    pub publication_info: Vec<PublicationInfoView>,
    pub authors: Vec<AuthorView>,
}

impl ArticleAggregate {
    pub fn id(&self) -> ArticleId {
        self.article.id
    }

    pub fn first_identifier(&self, kind: IdentifierType) -> Option<&str> {
        self.identifiers
            .iter()
            .find(|i| i.identifier_type == kind)
            .map(|i| i.identifier_value.as_str())
    }

    pub fn dois(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .filter(|i| i.identifier_type == IdentifierType::Doi)
            .map(|i| i.identifier_value.as_str())
            .collect()
    }

    pub fn first_journal_title(&self) -> Option<&str> {
        self.publication_info
            .first()
            .map(|p| p.info.fields.journal_title.as_str())
    }

    pub fn primary_category(&self) -> Option<&str> {
        self.arxiv_categories
            .iter()
            .find(|c| c.primary)
            .map(|c| c.category.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    Workflow,
    Legacy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseDraft {
    pub url: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDraft {
    pub name: String,
    pub filetype: Option<String>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprintDraft {
    pub publisher: String,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationInfoDraft {
    pub journal_title: String,
    pub journal_volume: String,
    pub journal_issue: String,
    pub page_start: String,
    pub page_end: String,
    pub artid: String,
    pub year: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationDraft {
    pub value: String,
    pub organization: String,
    pub country: Option<String>,
    pub ror: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorDraft {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub orcid: Option<String>,
    pub affiliations: Vec<AffiliationDraft>,
}

/// Parsed/pre-normalized handoff contract from payload adapters into the importer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub shape: PayloadShape,
    pub article_id: Option<ArticleId>,
    pub created_at: Option<DateTime<Utc>>,
    pub fields: ArticleFields,
    pub dois: Vec<String>,
    pub arxiv_ids: Vec<String>,
    pub arxiv_categories: Vec<String>,
    pub licenses: Vec<LicenseDraft>,
    pub files: Vec<FileDraft>,
    pub copyrights: Vec<CopyrightFields>,
    pub imprints: Vec<ImprintDraft>,
    pub publication_info: Vec<PublicationInfoDraft>,
    pub collaborations: Vec<String>,
    pub authors: Vec<AuthorDraft>,
}

impl RecordDraft {
    pub fn empty(shape: PayloadShape) -> Self {
        Self {
            shape,
            article_id: None,
            created_at: None,
            fields: ArticleFields::default(),
            dois: Vec::new(),
            arxiv_ids: Vec::new(),
            arxiv_categories: Vec::new(),
            licenses: Vec::new(),
            files: Vec::new(),
            copyrights: Vec::new(),
            imprints: Vec::new(),
            publication_info: Vec::new(),
            collaborations: Vec::new(),
            authors: Vec::new(),
        }
    }
}
