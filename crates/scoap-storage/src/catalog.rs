use async_trait::async_trait;
use scoap_core::{
    Affiliation, Article, ArticleAggregate, ArticleFile, ArticleId, ArticleIdentifier,
    ArxivCategory, Author, AuthorIdentifier, ComplianceReport, Copyright, CopyrightFields,
    Country, ExperimentalCollaboration, IdentifierType, InstitutionIdentifier, License,
    NewAffiliation, NewArticle, NewAuthor, NewComplianceReport, PublicationInfo,
    PublicationInfoFields, Publisher,
};
use thiserror::Error;

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("{entity} {key} already exists")]
    Duplicate { entity: &'static str, key: String },
    #[error("conflicting concurrent write: {0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// Conflicts come from racing writers on a natural key; replaying the unit of work resolves them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return Self::Conflict(db.message().to_string());
            }
        }
        Self::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How a child row reacts when the article already owns one of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Insert unless an identical natural key exists; never touch existing rows.
    Additive,
    /// Overwrite the existing row's fields, inserting only when none exists.
    ReplaceInPlace,
}

/// Entry point to the canonical store. Every unit of work runs inside one [`CatalogTx`].
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn CatalogTx>>;

    /// Make the next allocated article id equal `next_id`. Refused unless above the current max id.
    async fn restart_article_sequence(&self, next_id: ArticleId) -> StoreResult<()>;

    async fn compliance_report(&self, article_id: ArticleId) -> StoreResult<Option<ComplianceReport>>;
}

/// One atomic unit of work. Dropping without [`CatalogTx::commit`] discards every write.
#[async_trait]
pub trait CatalogTx: Send {
    /// Serializes writers that share a natural key (e.g. a DOI) until this transaction ends.
    async fn lock_natural_key(&mut self, key: &str) -> StoreResult<()>;

    async fn get_or_create_country(&mut self, code: &str, name: &str) -> StoreResult<Country>;
    async fn get_or_create_license(&mut self, url: &str, name: &str) -> StoreResult<License>;
    async fn get_or_create_publisher(&mut self, name: &str) -> StoreResult<Publisher>;
    async fn get_or_create_collaboration(&mut self, name: &str) -> StoreResult<ExperimentalCollaboration>;
    async fn get_or_create_affiliation(&mut self, key: &NewAffiliation) -> StoreResult<Affiliation>;
    async fn get_or_create_institution_identifier(
        &mut self,
        affiliation_id: i64,
        identifier_type: &str,
        value: &str,
    ) -> StoreResult<InstitutionIdentifier>;
    async fn link_author_affiliation(&mut self, author_id: i64, affiliation_id: i64) -> StoreResult<()>;

    async fn find_article_by_identifier(
        &mut self,
        kind: IdentifierType,
        value: &str,
    ) -> StoreResult<Option<ArticleId>>;
    /// Load and row-lock an article for the rest of the transaction.
    async fn lock_article(&mut self, id: ArticleId) -> StoreResult<Option<Article>>;
    async fn insert_article(&mut self, new: &NewArticle) -> StoreResult<Article>;
    async fn update_article(&mut self, article: &Article) -> StoreResult<Article>;
    async fn set_article_licenses(&mut self, article_id: ArticleId, license_ids: &[i64]) -> StoreResult<()>;

    async fn get_or_create_file(
        &mut self,
        article_id: ArticleId,
        file_path: &str,
        filetype: Option<&str>,
    ) -> StoreResult<ArticleFile>;

    async fn list_identifiers(&mut self, article_id: ArticleId) -> StoreResult<Vec<ArticleIdentifier>>;
    async fn insert_identifier(
        &mut self,
        article_id: ArticleId,
        kind: IdentifierType,
        value: &str,
    ) -> StoreResult<ArticleIdentifier>;
    async fn update_identifier_value(&mut self, identifier_id: i64, value: &str) -> StoreResult<()>;

    async fn list_copyrights(&mut self, article_id: ArticleId) -> StoreResult<Vec<Copyright>>;
    async fn insert_copyright(&mut self, article_id: ArticleId, fields: &CopyrightFields) -> StoreResult<Copyright>;
    async fn update_copyright(&mut self, copyright: &Copyright) -> StoreResult<()>;
    /// Replace the article's category set with `(category, primary)` pairs in order.
    async fn replace_arxiv_categories(
        &mut self,
        article_id: ArticleId,
        categories: &[(String, bool)],
    ) -> StoreResult<Vec<ArxivCategory>>;

    async fn list_publication_info(&mut self, article_id: ArticleId) -> StoreResult<Vec<PublicationInfo>>;
    async fn insert_publication_info(
        &mut self,
        article_id: ArticleId,
        publisher_id: i64,
        fields: &PublicationInfoFields,
    ) -> StoreResult<PublicationInfo>;
    async fn update_publication_info(&mut self, info: &PublicationInfo) -> StoreResult<()>;
    /// Remove publication info rows by id, returning how many were deleted.
    async fn delete_publication_info(&mut self, ids: &[i64]) -> StoreResult<u64>;

    async fn get_or_create_author(&mut self, key: &NewAuthor) -> StoreResult<Author>;
    async fn get_or_create_author_identifier(
        &mut self,
        author_id: i64,
        identifier_type: &str,
        value: &str,
    ) -> StoreResult<AuthorIdentifier>;

    async fn load_aggregate(&mut self, id: ArticleId) -> StoreResult<Option<ArticleAggregate>>;
    /// Delete every report of the article, then insert this one.
    async fn replace_compliance_report(&mut self, report: &NewComplianceReport) -> StoreResult<ComplianceReport>;
    /// Force `compliant = true` on existing reports; returns the article ids that had one.
    async fn mark_reports_compliant(&mut self, article_ids: &[ArticleId]) -> StoreResult<Vec<ArticleId>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
