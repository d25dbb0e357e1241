//! In-process catalog with the same semantics as the Postgres store.
//!
//! A transaction takes the catalog mutex for its whole lifetime and works on a
//! copy of the state; commit swaps the copy in, drop discards it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use scoap_core::{
    Affiliation, AffiliationView, Article, ArticleAggregate, ArticleFile, ArticleId,
    ArticleIdentifier, ArxivCategory, Author, AuthorIdentifier, AuthorView, ComplianceReport,
    Copyright, CopyrightFields, Country, ExperimentalCollaboration, IdentifierType,
    InstitutionIdentifier, License, NewAffiliation, NewArticle, NewAuthor, NewComplianceReport,
    PublicationInfo, PublicationInfoFields, PublicationInfoView, Publisher,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::catalog::{CatalogStore, CatalogTx, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Table<T> {
    rows: Vec<T>,
    next_id: i64,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            next_id: 1,
        }
    }
}

impl<T: Clone> Table<T> {
    fn allocate(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert_with(&mut self, make: impl FnOnce(i64) -> T) -> T {
        let id = self.allocate();
        let row = make(id);
        self.rows.push(row.clone());
        row
    }

    fn get_or_create(&mut self, matches: impl Fn(&T) -> bool, make: impl FnOnce(i64) -> T) -> T {
        match self.rows.iter().find(|row| matches(row)) {
            Some(row) => row.clone(),
            None => self.insert_with(make),
        }
    }

    fn find(&self, matches: impl Fn(&T) -> bool) -> Option<&T> {
        self.rows.iter().find(|row| matches(row))
    }

    fn find_mut(&mut self, matches: impl Fn(&T) -> bool) -> Option<&mut T> {
        self.rows.iter_mut().find(|row| matches(row))
    }

    fn filter(&self, matches: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows.iter().filter(|row| matches(row)).cloned().collect()
    }
}

#[derive(Debug, Clone)]
struct CatalogState {
    next_article_id: ArticleId,
    articles: BTreeMap<ArticleId, Article>,
    identifiers: Table<ArticleIdentifier>,
    files: Table<ArticleFile>,
    licenses: Table<License>,
    article_licenses: Vec<(ArticleId, i64)>,
    copyrights: Table<Copyright>,
    categories: Table<ArxivCategory>,
    publishers: Table<Publisher>,
    publication_info: Table<PublicationInfo>,
    countries: Vec<Country>,
    authors: Table<Author>,
    author_identifiers: Table<AuthorIdentifier>,
    affiliations: Table<Affiliation>,
    author_affiliations: Vec<(i64, i64)>,
    institution_identifiers: Table<InstitutionIdentifier>,
    collaborations: Table<ExperimentalCollaboration>,
    reports: Table<ComplianceReport>,
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            next_article_id: 1,
            articles: BTreeMap::new(),
            identifiers: Table::default(),
            files: Table::default(),
            licenses: Table::default(),
            article_licenses: Vec::new(),
            copyrights: Table::default(),
            categories: Table::default(),
            publishers: Table::default(),
            publication_info: Table::default(),
            countries: Vec::new(),
            authors: Table::default(),
            author_identifiers: Table::default(),
            affiliations: Table::default(),
            author_affiliations: Vec::new(),
            institution_identifiers: Table::default(),
            collaborations: Table::default(),
            reports: Table::default(),
        }
    }
}

impl CatalogState {
    fn max_article_id(&self) -> ArticleId {
        self.articles.keys().next_back().copied().unwrap_or(0)
    }

    fn aggregate(&self, id: ArticleId) -> Option<ArticleAggregate> {
        let article = self.articles.get(&id)?.clone();

        let licenses = self
            .article_licenses
            .iter()
            .filter(|(article_id, _)| *article_id == id)
            .filter_map(|(_, license_id)| self.licenses.find(|l| l.id == *license_id).cloned())
            .collect();

        let publication_info = self
            .publication_info
            .filter(|p| p.article_id == id)
            .into_iter()
            .filter_map(|info| {
                let publisher = self.publishers.find(|p| p.id == info.publisher_id)?.clone();
                Some(PublicationInfoView { info, publisher })
            })
            .collect();

        let mut authors = self.authors.filter(|a| a.article_id == id);
        authors.sort_by_key(|a| (a.author_order, a.id));
        let authors = authors
            .into_iter()
            .map(|author| self.author_view(author))
            .collect();

        Some(ArticleAggregate {
            article,
            identifiers: self.identifiers.filter(|i| i.article_id == id),
            files: self.files.filter(|f| f.article_id == id),
            licenses,
            copyrights: self.copyrights.filter(|c| c.article_id == id),
            arxiv_categories: self.categories.filter(|c| c.article_id == id),
            publication_info,
            authors,
        })
    }

    fn author_view(&self, author: Author) -> AuthorView {
        let affiliations = self
            .author_affiliations
            .iter()
            .filter(|(author_id, _)| *author_id == author.id)
            .filter_map(|(_, affiliation_id)| self.affiliations.find(|a| a.id == *affiliation_id))
            .map(|affiliation| AffiliationView {
                country: affiliation
                    .country_code
                    .as_deref()
                    .and_then(|code| self.countries.iter().find(|c| c.code == code))
                    .cloned(),
                institution_identifiers: self
                    .institution_identifiers
                    .filter(|i| i.affiliation_id == affiliation.id),
                affiliation: affiliation.clone(),
            })
            .collect();

        AuthorView {
            identifiers: self.author_identifiers.filter(|i| i.author_id == author.id),
            affiliations,
            author,
        }
    }
}

/// Row counts per table, for assertions about idempotency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub articles: usize,
    pub identifiers: usize,
    pub files: usize,
    pub licenses: usize,
    pub copyrights: usize,
    pub arxiv_categories: usize,
    pub publishers: usize,
    pub publication_info: usize,
    pub countries: usize,
    pub authors: usize,
    pub author_identifiers: usize,
    pub affiliations: usize,
    pub author_affiliations: usize,
    pub institution_identifiers: usize,
    pub collaborations: usize,
    pub compliance_reports: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn counts(&self) -> TableCounts {
        let state = self.state.lock().await;
        TableCounts {
            articles: state.articles.len(),
            identifiers: state.identifiers.rows.len(),
            files: state.files.rows.len(),
            licenses: state.licenses.rows.len(),
            copyrights: state.copyrights.rows.len(),
            arxiv_categories: state.categories.rows.len(),
            publishers: state.publishers.rows.len(),
            publication_info: state.publication_info.rows.len(),
            countries: state.countries.len(),
            authors: state.authors.rows.len(),
            author_identifiers: state.author_identifiers.rows.len(),
            affiliations: state.affiliations.rows.len(),
            author_affiliations: state.author_affiliations.len(),
            institution_identifiers: state.institution_identifiers.rows.len(),
            collaborations: state.collaborations.rows.len(),
            compliance_reports: state.reports.rows.len(),
        }
    }

    pub async fn aggregate(&self, id: ArticleId) -> Option<ArticleAggregate> {
        self.state.lock().await.aggregate(id)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn begin(&self) -> StoreResult<Box<dyn CatalogTx>> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }

    async fn restart_article_sequence(&self, next_id: ArticleId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let max_id = state.max_article_id();
        if next_id <= max_id {
            return Err(StoreError::Invalid(format!(
                "next article id {next_id} must be greater than the current maximum {max_id}"
            )));
        }
        state.next_article_id = next_id;
        Ok(())
    }

    async fn compliance_report(&self, article_id: ArticleId) -> StoreResult<Option<ComplianceReport>> {
        let state = self.state.lock().await;
        Ok(state.reports.find(|r| r.article_id == article_id).cloned())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<CatalogState>,
    work: CatalogState,
}

impl MemoryTx {
    fn require_article(&self, id: ArticleId) -> StoreResult<()> {
        if self.work.articles.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                entity: "article",
                key: id.to_string(),
            })
        }
    }
}

#[async_trait]
impl CatalogTx for MemoryTx {
    async fn lock_natural_key(&mut self, _key: &str) -> StoreResult<()> {
        // The transaction already holds the catalog mutex.
        Ok(())
    }

    async fn get_or_create_country(&mut self, code: &str, name: &str) -> StoreResult<Country> {
        if let Some(country) = self.work.countries.iter().find(|c| c.code == code) {
            return Ok(country.clone());
        }
        let country = Country {
            code: code.to_string(),
            name: name.to_string(),
        };
        self.work.countries.push(country.clone());
        Ok(country)
    }

    async fn get_or_create_license(&mut self, url: &str, name: &str) -> StoreResult<License> {
        Ok(self.work.licenses.get_or_create(
            |l| l.url == url && l.name == name,
            |id| License {
                id,
                url: url.to_string(),
                name: name.to_string(),
            },
        ))
    }

    async fn get_or_create_publisher(&mut self, name: &str) -> StoreResult<Publisher> {
        Ok(self.work.publishers.get_or_create(
            |p| p.name == name,
            |id| Publisher {
                id,
                name: name.to_string(),
            },
        ))
    }

    async fn get_or_create_collaboration(&mut self, name: &str) -> StoreResult<ExperimentalCollaboration> {
        Ok(self.work.collaborations.get_or_create(
            |c| c.name == name,
            |id| ExperimentalCollaboration {
                id,
                name: name.to_string(),
            },
        ))
    }

    async fn get_or_create_affiliation(&mut self, key: &NewAffiliation) -> StoreResult<Affiliation> {
        Ok(self.work.affiliations.get_or_create(
            |a| {
                a.value == key.value
                    && a.organization == key.organization
                    && a.country_code == key.country_code
            },
            |id| Affiliation {
                id,
                value: key.value.clone(),
                organization: key.organization.clone(),
                country_code: key.country_code.clone(),
            },
        ))
    }

    async fn get_or_create_institution_identifier(
        &mut self,
        affiliation_id: i64,
        identifier_type: &str,
        value: &str,
    ) -> StoreResult<InstitutionIdentifier> {
        Ok(self.work.institution_identifiers.get_or_create(
            |i| {
                i.affiliation_id == affiliation_id
                    && i.identifier_type == identifier_type
                    && i.identifier_value == value
            },
            |id| InstitutionIdentifier {
                id,
                affiliation_id,
                identifier_type: identifier_type.to_string(),
                identifier_value: value.to_string(),
            },
        ))
    }

    async fn link_author_affiliation(&mut self, author_id: i64, affiliation_id: i64) -> StoreResult<()> {
        let link = (author_id, affiliation_id);
        if !self.work.author_affiliations.contains(&link) {
            self.work.author_affiliations.push(link);
        }
        Ok(())
    }

    async fn find_article_by_identifier(
        &mut self,
        kind: IdentifierType,
        value: &str,
    ) -> StoreResult<Option<ArticleId>> {
        Ok(self
            .work
            .identifiers
            .find(|i| i.identifier_type == kind && i.identifier_value == value)
            .map(|i| i.article_id))
    }

    async fn lock_article(&mut self, id: ArticleId) -> StoreResult<Option<Article>> {
        Ok(self.work.articles.get(&id).cloned())
    }

    async fn insert_article(&mut self, new: &NewArticle) -> StoreResult<Article> {
        let id = match new.id {
            Some(id) => {
                if self.work.articles.contains_key(&id) {
                    return Err(StoreError::Duplicate {
                        entity: "article",
                        key: id.to_string(),
                    });
                }
                self.work.next_article_id = self.work.next_article_id.max(id + 1);
                id
            }
            None => {
                let id = self.work.next_article_id;
                self.work.next_article_id += 1;
                id
            }
        };
        let article = Article {
            id,
            fields: new.fields.clone(),
            created_at: new.created_at,
            updated_at: Utc::now(),
        };
        self.work.articles.insert(id, article.clone());
        Ok(article)
    }

    async fn update_article(&mut self, article: &Article) -> StoreResult<Article> {
        let stored = self
            .work
            .articles
            .get_mut(&article.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "article",
                key: article.id.to_string(),
            })?;
        stored.fields = article.fields.clone();
        stored.created_at = article.created_at;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn set_article_licenses(&mut self, article_id: ArticleId, license_ids: &[i64]) -> StoreResult<()> {
        self.require_article(article_id)?;
        self.work.article_licenses.retain(|(a, _)| *a != article_id);
        for license_id in license_ids {
            let link = (article_id, *license_id);
            if !self.work.article_licenses.contains(&link) {
                self.work.article_licenses.push(link);
            }
        }
        Ok(())
    }

    async fn get_or_create_file(
        &mut self,
        article_id: ArticleId,
        file_path: &str,
        filetype: Option<&str>,
    ) -> StoreResult<ArticleFile> {
        self.require_article(article_id)?;
        Ok(self.work.files.get_or_create(
            |f| f.article_id == article_id && f.file_path == file_path,
            |id| ArticleFile {
                id,
                article_id,
                file_path: file_path.to_string(),
                filetype: filetype.map(str::to_string),
            },
        ))
    }

    async fn list_identifiers(&mut self, article_id: ArticleId) -> StoreResult<Vec<ArticleIdentifier>> {
        Ok(self.work.identifiers.filter(|i| i.article_id == article_id))
    }

    async fn insert_identifier(
        &mut self,
        article_id: ArticleId,
        kind: IdentifierType,
        value: &str,
    ) -> StoreResult<ArticleIdentifier> {
        self.require_article(article_id)?;
        if kind == IdentifierType::Doi
            && self
                .work
                .identifiers
                .find(|i| i.identifier_type == kind && i.identifier_value == value)
                .is_some()
        {
            return Err(StoreError::Conflict(format!("DOI {value} belongs to another article")));
        }
        Ok(self.work.identifiers.insert_with(|id| ArticleIdentifier {
            id,
            article_id,
            identifier_type: kind,
            identifier_value: value.to_string(),
        }))
    }

    async fn update_identifier_value(&mut self, identifier_id: i64, value: &str) -> StoreResult<()> {
        let row = self
            .work
            .identifiers
            .find_mut(|i| i.id == identifier_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "article_identifier",
                key: identifier_id.to_string(),
            })?;
        row.identifier_value = value.to_string();
        Ok(())
    }

    async fn list_copyrights(&mut self, article_id: ArticleId) -> StoreResult<Vec<Copyright>> {
        Ok(self.work.copyrights.filter(|c| c.article_id == article_id))
    }

    async fn insert_copyright(&mut self, article_id: ArticleId, fields: &CopyrightFields) -> StoreResult<Copyright> {
        self.require_article(article_id)?;
        Ok(self.work.copyrights.insert_with(|id| Copyright {
            id,
            article_id,
            fields: fields.clone(),
        }))
    }

    async fn update_copyright(&mut self, copyright: &Copyright) -> StoreResult<()> {
        let row = self
            .work
            .copyrights
            .find_mut(|c| c.id == copyright.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "copyright",
                key: copyright.id.to_string(),
            })?;
        row.fields = copyright.fields.clone();
        Ok(())
    }

    async fn replace_arxiv_categories(
        &mut self,
        article_id: ArticleId,
        categories: &[(String, bool)],
    ) -> StoreResult<Vec<ArxivCategory>> {
        self.require_article(article_id)?;
        let existing = self.work.categories.filter(|c| c.article_id == article_id);
        self.work.categories.rows.retain(|c| c.article_id != article_id);

        let mut stored = Vec::with_capacity(categories.len());
        for (category, primary) in categories {
            let reused = existing.iter().find(|c| &c.category == category).map(|c| c.id);
            let row = ArxivCategory {
                id: reused.unwrap_or_else(|| self.work.categories.allocate()),
                article_id,
                category: category.clone(),
                primary: *primary,
            };
            self.work.categories.rows.push(row.clone());
            stored.push(row);
        }
        Ok(stored)
    }

    async fn list_publication_info(&mut self, article_id: ArticleId) -> StoreResult<Vec<PublicationInfo>> {
        Ok(self.work.publication_info.filter(|p| p.article_id == article_id))
    }

    async fn insert_publication_info(
        &mut self,
        article_id: ArticleId,
        publisher_id: i64,
        fields: &PublicationInfoFields,
    ) -> StoreResult<PublicationInfo> {
        self.require_article(article_id)?;
        Ok(self.work.publication_info.insert_with(|id| PublicationInfo {
            id,
            article_id,
            publisher_id,
            fields: fields.clone(),
        }))
    }

    async fn update_publication_info(&mut self, info: &PublicationInfo) -> StoreResult<()> {
        let row = self
            .work
            .publication_info
            .find_mut(|p| p.id == info.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "publication_info",
                key: info.id.to_string(),
            })?;
        row.publisher_id = info.publisher_id;
        row.fields = info.fields.clone();
        Ok(())
    }

    async fn delete_publication_info(&mut self, ids: &[i64]) -> StoreResult<u64> {
        let before = self.work.publication_info.rows.len();
        self.work.publication_info.rows.retain(|p| !ids.contains(&p.id));
        Ok((before - self.work.publication_info.rows.len()) as u64)
    }

    async fn get_or_create_author(&mut self, key: &NewAuthor) -> StoreResult<Author> {
        self.require_article(key.article_id)?;
        Ok(self.work.authors.get_or_create(
            |a| {
                a.article_id == key.article_id
                    && a.first_name == key.first_name
                    && a.last_name == key.last_name
                    && a.email == key.email
                    && a.author_order == key.author_order
            },
            |id| Author {
                id,
                article_id: key.article_id,
                first_name: key.first_name.clone(),
                last_name: key.last_name.clone(),
                email: key.email.clone(),
                author_order: key.author_order,
            },
        ))
    }

    async fn get_or_create_author_identifier(
        &mut self,
        author_id: i64,
        identifier_type: &str,
        value: &str,
    ) -> StoreResult<AuthorIdentifier> {
        Ok(self.work.author_identifiers.get_or_create(
            |i| {
                i.author_id == author_id
                    && i.identifier_type == identifier_type
                    && i.identifier_value == value
            },
            |id| AuthorIdentifier {
                id,
                author_id,
                identifier_type: identifier_type.to_string(),
                identifier_value: value.to_string(),
            },
        ))
    }

    async fn load_aggregate(&mut self, id: ArticleId) -> StoreResult<Option<ArticleAggregate>> {
        Ok(self.work.aggregate(id))
    }

    async fn replace_compliance_report(&mut self, report: &NewComplianceReport) -> StoreResult<ComplianceReport> {
        self.require_article(report.article_id)?;
        self.work.reports.rows.retain(|r| r.article_id != report.article_id);
        Ok(self.work.reports.insert_with(|id| ComplianceReport {
            id,
            article_id: report.article_id,
            report_date: report.report_date,
            checks: report.checks.clone(),
            compliant: report.compliant(),
        }))
    }

    async fn mark_reports_compliant(&mut self, article_ids: &[ArticleId]) -> StoreResult<Vec<ArticleId>> {
        let mut touched = Vec::new();
        for report in self.work.reports.rows.iter_mut() {
            if article_ids.contains(&report.article_id) {
                report.compliant = true;
                if !touched.contains(&report.article_id) {
                    touched.push(report.article_id);
                }
            }
        }
        touched.sort_unstable();
        Ok(touched)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}
