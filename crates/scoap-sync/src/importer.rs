use std::sync::Arc;

use chrono::{Datelike, Utc};
use scoap_adapters::{parse_payload, parse_payload_bytes, AdapterError};
use scoap_core::{
    AffiliationDraft, Article, ArticleAggregate, ArticleId, Author, AuthorDraft, IdentifierType, NewAffiliation,
    NewArticle, NewAuthor, PublicationInfoFields, RecordDraft, ORCID, ROR,
};
use scoap_storage::{CatalogStore, CatalogTx, StoreError, StoreResult};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::resolver::{normalize_license, CountryResolver};
use crate::tasks::{Task, TaskDispatcher};
use crate::upsert;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{0}")]
    Validation(String),
    #[error("conflicting concurrent import: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<AdapterError> for ImportError {
    fn from(err: AdapterError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<StoreError> for ImportError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::Invalid(message) => Self::Validation(message),
            other @ StoreError::Duplicate { .. } => Self::Validation(other.to_string()),
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Record an `ArticleFile` row per payload file.
    pub include_files: bool,
}

/// Storage path of an article file, relative to the files root.
pub fn article_file_path(article_id: ArticleId, file_name: &str) -> String {
    format!("files/{article_id}/{file_name}")
}

/// Normalizes one record into the catalog. Every import is one transaction; a successful commit
/// publishes an [`Task::EvaluateCompliance`] for the article.
pub struct Importer {
    store: Arc<dyn CatalogStore>,
    countries: CountryResolver,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    max_attempts: usize,
}

impl Importer {
    pub fn new(store: Arc<dyn CatalogStore>, countries: CountryResolver) -> Self {
        Self {
            store,
            countries,
            dispatcher: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn import_payload(
        &self,
        payload: &JsonValue,
        options: ImportOptions,
    ) -> Result<ArticleAggregate, ImportError> {
        let draft = parse_payload(payload)?;
        self.import_draft(&draft, options).await
    }

    pub async fn import_bytes(&self, bytes: &[u8], options: ImportOptions) -> Result<ArticleAggregate, ImportError> {
        let draft = parse_payload_bytes(bytes)?;
        self.import_draft(&draft, options).await
    }

    pub async fn import_draft(
        &self,
        draft: &RecordDraft,
        options: ImportOptions,
    ) -> Result<ArticleAggregate, ImportError> {
        if draft.dois.is_empty() {
            return Err(ImportError::Validation("record has no DOI".into()));
        }
        let span = info_span!("import_record", doi = %draft.dois[0], shape = ?draft.shape);

        let mut attempt = 1;
        let aggregate = loop {
            match self.import_once(draft, options).instrument(span.clone()).await {
                Ok(aggregate) => break aggregate,
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    warn!(parent: &span, attempt, error = %err, "import raced another writer; retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };

        info!(parent: &span, article_id = aggregate.id(), "record imported");
        self.publish(Task::EvaluateCompliance {
            article_id: aggregate.id(),
        })
        .await;
        Ok(aggregate)
    }

    async fn publish(&self, task: Task) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        if let Err(err) = dispatcher.submit(task).await {
            warn!(error = %err, "post-commit task not dispatched");
        }
    }

    async fn import_once(&self, draft: &RecordDraft, options: ImportOptions) -> StoreResult<ArticleAggregate> {
        let mut tx = self.store.begin().await?;
        for doi in &draft.dois {
            tx.lock_natural_key(&format!("doi:{doi}")).await?;
        }

        let mut license_ids = Vec::new();
        for entry in &draft.licenses {
            let Some(key) = normalize_license(entry) else {
                debug!(?entry, "skipping license without url or name");
                continue;
            };
            let license = tx.get_or_create_license(&key.url, &key.name).await?;
            if !license_ids.contains(&license.id) {
                license_ids.push(license.id);
            }
        }

        let article = resolve_article(tx.as_mut(), draft).await?;
        let article_id = article.id;

        tx.set_article_licenses(article_id, &license_ids).await?;

        if options.include_files {
            for file in &draft.files {
                tx.get_or_create_file(
                    article_id,
                    &article_file_path(article_id, &file.name),
                    file.filetype.as_deref(),
                )
                .await?;
            }
        }

        let identifiers = tx.list_identifiers(article_id).await?;
        for doi in &draft.dois {
            upsert::upsert_doi(tx.as_mut(), article_id, &identifiers, doi).await?;
        }
        if let Some(arxiv_id) = draft.arxiv_ids.first() {
            upsert::upsert_arxiv_id(tx.as_mut(), article_id, &identifiers, arxiv_id).await?;
        }

        if let Some(copyright) = draft.copyrights.first() {
            upsert::upsert_copyright(tx.as_mut(), article_id, copyright).await?;
        }

        let categories: Vec<(String, bool)> = draft
            .arxiv_categories
            .iter()
            .enumerate()
            .map(|(index, category)| (category.clone(), index == 0))
            .collect();
        tx.replace_arxiv_categories(article_id, &categories).await?;

        let mut publisher_ids = Vec::with_capacity(draft.imprints.len());
        for imprint in &draft.imprints {
            publisher_ids.push(tx.get_or_create_publisher(&imprint.publisher).await?.id);
        }
        let stored_info = tx.list_publication_info(article_id).await?;
        for (index, info) in draft.publication_info.iter().enumerate() {
            let Some(&publisher_id) = publisher_ids.get(index) else {
                warn!(index, "publication info has no matching imprint; skipped");
                continue;
            };
            let slot = stored_info.get(index);
            let volume_year = match (&info.year, slot) {
                (Some(year), _) => Some(year.clone()),
                (None, Some(stored)) => stored.fields.volume_year.clone(),
                (None, None) => Some(article.created_at.year().to_string()),
            };
            let fields = PublicationInfoFields {
                journal_title: info.journal_title.clone(),
                journal_volume: info.journal_volume.clone(),
                journal_issue: info.journal_issue.clone(),
                page_start: info.page_start.clone(),
                page_end: info.page_end.clone(),
                artid: info.artid.clone(),
                volume_year,
                journal_issue_date: draft.imprints.get(index).and_then(|imprint| imprint.date),
            };
            upsert::upsert_publication_info(tx.as_mut(), article_id, slot, publisher_id, &fields).await?;
        }
        let stale: Vec<i64> = stored_info
            .iter()
            .skip(draft.publication_info.len())
            .map(|info| info.id)
            .collect();
        if !stale.is_empty() {
            let removed = tx.delete_publication_info(&stale).await?;
            debug!(article_id, removed, "dropped publication info beyond the incoming entries");
        }

        for name in &draft.collaborations {
            tx.get_or_create_collaboration(name).await?;
        }

        let mut authors: Vec<Author> = Vec::with_capacity(draft.authors.len());
        for (order, author) in draft.authors.iter().enumerate() {
            authors.push(tx.get_or_create_author(&author_key(article_id, order, author)).await?);
        }
        for (row, author) in authors.iter().zip(&draft.authors) {
            if let Some(orcid) = &author.orcid {
                tx.get_or_create_author_identifier(row.id, ORCID, orcid).await?;
            }
        }
        for (row, author) in authors.iter().zip(&draft.authors) {
            link_author_affiliations(tx.as_mut(), &self.countries, row.id, &author.affiliations).await?;
        }

        let aggregate = tx
            .load_aggregate(article_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "article",
                key: article_id.to_string(),
            })?;
        tx.commit().await?;
        Ok(aggregate)
    }

    /// Re-runs affiliation resolution and linking for a record already in the catalog.
    /// `Ok(None)` when no article carries any of the record's DOIs.
    pub async fn link_affiliations(&self, draft: &RecordDraft) -> Result<Option<usize>, ImportError> {
        let mut tx = self.store.begin().await?;
        let Some(article_id) = find_by_identifiers(tx.as_mut(), draft).await? else {
            return Ok(None);
        };
        if tx.lock_article(article_id).await?.is_none() {
            return Ok(None);
        }

        let mut linked = 0;
        for (order, author) in draft.authors.iter().enumerate() {
            let row = tx.get_or_create_author(&author_key(article_id, order, author)).await?;
            linked += link_author_affiliations(tx.as_mut(), &self.countries, row.id, &author.affiliations).await?;
        }
        tx.commit().await?;
        debug!(article_id, linked, "affiliations linked");
        Ok(Some(linked))
    }
}

fn author_key(article_id: ArticleId, order: usize, author: &AuthorDraft) -> NewAuthor {
    NewAuthor {
        article_id,
        first_name: author.first_name.clone(),
        last_name: author.last_name.clone(),
        email: author.email.clone(),
        author_order: order as i32,
    }
}

async fn find_by_identifiers(tx: &mut dyn CatalogTx, draft: &RecordDraft) -> StoreResult<Option<ArticleId>> {
    for doi in &draft.dois {
        if let Some(id) = tx.find_article_by_identifier(IdentifierType::Doi, doi).await? {
            return Ok(Some(id));
        }
    }
    for arxiv_id in &draft.arxiv_ids {
        if let Some(id) = tx.find_article_by_identifier(IdentifierType::Arxiv, arxiv_id).await? {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// DOI first, then arXiv id, then the payload's explicit id; otherwise a new article.
async fn resolve_article(tx: &mut dyn CatalogTx, draft: &RecordDraft) -> StoreResult<Article> {
    let mut existing = None;
    if let Some(id) = find_by_identifiers(tx, draft).await? {
        existing = tx.lock_article(id).await?;
    }
    if existing.is_none() {
        if let Some(id) = draft.article_id {
            existing = tx.lock_article(id).await?;
        }
    }

    match existing {
        Some(mut article) => {
            article.fields = draft.fields.clone();
            if let Some(created_at) = draft.created_at {
                article.created_at = created_at;
            }
            tx.update_article(&article).await
        }
        None => {
            tx.insert_article(&NewArticle {
                id: draft.article_id,
                fields: draft.fields.clone(),
                created_at: draft.created_at.unwrap_or_else(Utc::now),
            })
            .await
        }
    }
}

/// Resolves, get-or-creates and links each affiliation of one author. Returns how many were linked.
pub async fn link_author_affiliations(
    tx: &mut dyn CatalogTx,
    countries: &CountryResolver,
    author_id: i64,
    affiliations: &[AffiliationDraft],
) -> StoreResult<usize> {
    let mut linked = 0;
    for draft in affiliations {
        if draft.value.is_empty() && draft.organization.is_empty() {
            continue;
        }
        let country = match draft.country.as_deref().and_then(|text| countries.resolve(text)) {
            Some(country) => Some(tx.get_or_create_country(&country.code, &country.name).await?),
            None => None,
        };
        let affiliation = tx
            .get_or_create_affiliation(&NewAffiliation {
                value: draft.value.clone(),
                organization: draft.organization.clone(),
                country_code: country.map(|c| c.code),
            })
            .await?;
        tx.link_author_affiliation(author_id, affiliation.id).await?;
        if let Some(ror) = &draft.ror {
            tx.get_or_create_institution_identifier(affiliation.id, ROR, ror).await?;
        }
        linked += 1;
    }
    Ok(linked)
}
