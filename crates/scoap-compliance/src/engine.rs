use std::sync::Arc;

use chrono::Utc;
use scoap_core::{
    ArticleAggregate, ArticleId, ComplianceChecks, ComplianceReport, IdentifierType,
    NewComplianceReport, RuleOutcome,
};
use scoap_storage::{CatalogStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::checks::{self, FileScan};
use crate::doi::DoiRegistry;
use crate::rules::CompliancePolicy;
use crate::scan::{FileTextScanner, ScanError};

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-id outcome of a bulk evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkEvaluation {
    pub compliant: Vec<ArticleId>,
    pub non_compliant: Vec<ArticleId>,
    pub not_found: Vec<ArticleId>,
    pub failed: Vec<(ArticleId, String)>,
}

pub struct ComplianceEngine {
    store: Arc<dyn CatalogStore>,
    policy: CompliancePolicy,
    registry: Arc<dyn DoiRegistry>,
    scanner: Arc<dyn FileTextScanner>,
}

impl ComplianceEngine {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        policy: CompliancePolicy,
        registry: Arc<dyn DoiRegistry>,
        scanner: Arc<dyn FileTextScanner>,
    ) -> Self {
        Self {
            store,
            policy,
            registry,
            scanner,
        }
    }

    pub fn policy(&self) -> &CompliancePolicy {
        &self.policy
    }

    /// Runs all seven rules and replaces the article's report. `Ok(None)` means no such article.
    pub async fn evaluate(&self, article_id: ArticleId) -> Result<Option<ComplianceReport>, ComplianceError> {
        self.evaluate_locked(article_id)
            .instrument(info_span!("evaluate_compliance", article_id))
            .await
    }

    async fn evaluate_locked(&self, article_id: ArticleId) -> Result<Option<ComplianceReport>, ComplianceError> {
        let mut tx = self.store.begin().await?;
        if tx.lock_article(article_id).await?.is_none() {
            warn!("article not found");
            return Ok(None);
        }
        let Some(aggregate) = tx.load_aggregate(article_id).await? else {
            warn!("article not found");
            return Ok(None);
        };

        let checks = self.run_checks(&aggregate).await;
        let report = tx
            .replace_compliance_report(&NewComplianceReport {
                article_id,
                report_date: Utc::now(),
                checks,
            })
            .await?;
        tx.commit().await?;

        info!(compliant = report.compliant, "compliance checks completed");
        Ok(Some(report))
    }

    pub async fn evaluate_many(&self, article_ids: &[ArticleId]) -> BulkEvaluation {
        let mut summary = BulkEvaluation::default();
        for &id in article_ids {
            match self.evaluate(id).await {
                Ok(Some(report)) if report.compliant => summary.compliant.push(id),
                Ok(Some(_)) => summary.non_compliant.push(id),
                Ok(None) => summary.not_found.push(id),
                Err(err) => {
                    warn!(article_id = id, error = %err, "compliance evaluation failed");
                    summary.failed.push((id, err.to_string()));
                }
            }
        }
        summary
    }

    /// Forces `compliant = true` on the existing reports of `article_ids`. Articles without a report are skipped.
    pub async fn mark_compliant(&self, article_ids: &[ArticleId]) -> Result<Vec<ArticleId>, ComplianceError> {
        let mut tx = self.store.begin().await?;
        let touched = tx.mark_reports_compliant(article_ids).await?;
        tx.commit().await?;
        info!(requested = article_ids.len(), marked = touched.len(), "marked reports compliant");
        Ok(touched)
    }

    pub async fn run_checks(&self, article: &ArticleAggregate) -> ComplianceChecks {
        let (doi_registration_time, funded_by_scoap3) =
            tokio::join!(self.doi_registration_check(article), self.funding_check(article));
        ComplianceChecks {
            license: checks::license(article, &self.policy),
            required_file_formats: checks::required_file_formats(article, &self.policy),
            article_type: checks::article_type(article, &self.policy),
            arxiv_category: checks::arxiv_category(article, &self.policy),
            doi_registration_time,
            authors_affiliation: checks::authors_affiliation(article),
            funded_by_scoap3,
        }
    }

    async fn doi_registration_check(&self, article: &ArticleAggregate) -> RuleOutcome {
        let Some(doi) = article.first_identifier(IdentifierType::Doi) else {
            warn!(article_id = article.id(), "DOI not found in our system");
            return checks::missing_doi();
        };
        let registered = match self.registry.registration_date(doi).await {
            Ok(Some(date)) => Some(date),
            Ok(None) => {
                warn!(article_id = article.id(), doi, "DOI registration date not found");
                None
            }
            Err(err) => {
                warn!(article_id = article.id(), doi, error = %err, "DOI registration lookup failed");
                None
            }
        };
        checks::doi_registration_time(
            article.article.created_at.date_naive(),
            registered,
            self.policy.max_doi_registration_days,
        )
    }

    async fn funding_check(&self, article: &ArticleAggregate) -> RuleOutcome {
        let mut scans = Vec::with_capacity(article.files.len());
        for file in &article.files {
            let scan = match self
                .scanner
                .contains_text(&file.file_path, &self.policy.funding_phrase)
                .await
            {
                Ok(true) => FileScan::Contains,
                Ok(false) => FileScan::Absent,
                Err(ScanError::NotFound(path)) => {
                    warn!(article_id = article.id(), path = %path, "article file missing");
                    FileScan::Missing(path)
                }
                Err(err) => {
                    warn!(article_id = article.id(), error = %err, "article file unreadable");
                    FileScan::Unreadable(file.file_path.clone())
                }
            };
            let found = scan == FileScan::Contains;
            scans.push(scan);
            if found {
                break;
            }
        }
        checks::funded_by_scoap3(&scans, &self.policy.funding_phrase)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use scoap_core::{
        ArticleFields, CopyrightFields, NewAffiliation, NewArticle, NewAuthor, PublicationInfoFields,
    };
    use scoap_storage::MemoryCatalog;

    use super::*;
    use crate::doi::DoiLookupError;

    struct FixedRegistry(Result<Option<NaiveDate>, ()>);

    #[async_trait]
    impl DoiRegistry for FixedRegistry {
        async fn registration_date(&self, doi: &str) -> Result<Option<NaiveDate>, DoiLookupError> {
            self.0.map_err(|_| DoiLookupError::Parse {
                doi: doi.to_string(),
                message: "registry unavailable".into(),
            })
        }
    }

    #[derive(Default)]
    struct MapScanner(HashMap<String, String>);

    #[async_trait]
    impl FileTextScanner for MapScanner {
        async fn contains_text(&self, file_path: &str, needle: &str) -> Result<bool, ScanError> {
            self.0
                .get(file_path)
                .map(|text| text.to_lowercase().contains(&needle.to_lowercase()))
                .ok_or_else(|| ScanError::NotFound(file_path.to_string()))
        }
    }

    struct Seed {
        title: &'static str,
        journal: &'static str,
        files: Vec<(&'static str, &'static str)>,
        with_affiliation: bool,
    }

    impl Default for Seed {
        fn default() -> Self {
            Self {
                title: "Measurement of the top quark mass",
                journal: "Nuclear Physics B",
                files: vec![
                    ("files/{id}/main.pdf", "pdf"),
                    ("files/{id}/main_a-2b.pdf", "pdf/a"),
                    ("files/{id}/main.xml", "xml"),
                ],
                with_affiliation: true,
            }
        }
    }

    fn created_at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 6, 8, 15, 0).unwrap()
    }

    async fn seed(store: &MemoryCatalog, seed: Seed) -> ArticleId {
        let mut tx = store.begin().await.unwrap();
        let article = tx
            .insert_article(&NewArticle {
                id: None,
                fields: ArticleFields {
                    title: seed.title.to_string(),
                    ..Default::default()
                },
                created_at: created_at(),
            })
            .await
            .unwrap();
        let id = article.id;
        tx.insert_identifier(id, IdentifierType::Doi, &format!("10.1000/test.{id}"))
            .await
            .unwrap();
        let license = tx
            .get_or_create_license("https://creativecommons.org/licenses/by/3.0/", "CC-BY-3.0")
            .await
            .unwrap();
        tx.set_article_licenses(id, &[license.id]).await.unwrap();
        for (path, kind) in &seed.files {
            tx.get_or_create_file(id, &path.replace("{id}", &id.to_string()), Some(*kind))
                .await
                .unwrap();
        }
        tx.insert_copyright(id, &CopyrightFields::default()).await.unwrap();
        let publisher = tx.get_or_create_publisher("Elsevier").await.unwrap();
        tx.insert_publication_info(
            id,
            publisher.id,
            &PublicationInfoFields {
                journal_title: seed.journal.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let author = tx
            .get_or_create_author(&NewAuthor {
                article_id: id,
                first_name: "Ana".into(),
                last_name: "Novak".into(),
                email: None,
                author_order: 0,
            })
            .await
            .unwrap();
        if seed.with_affiliation {
            let affiliation = tx
                .get_or_create_affiliation(&NewAffiliation {
                    value: "CERN, Geneva".into(),
                    organization: "CERN".into(),
                    country_code: None,
                })
                .await
                .unwrap();
            tx.link_author_affiliation(author.id, affiliation.id).await.unwrap();
        }
        tx.commit().await.unwrap();
        id
    }

    fn engine(store: &MemoryCatalog, registered: Result<Option<NaiveDate>, ()>, texts: &[(String, &str)]) -> ComplianceEngine {
        let scanner = MapScanner(
            texts
                .iter()
                .map(|(path, text)| (path.clone(), text.to_string()))
                .collect(),
        );
        ComplianceEngine::new(
            Arc::new(store.clone()),
            CompliancePolicy::default(),
            Arc::new(FixedRegistry(registered)),
            Arc::new(scanner),
        )
    }

    fn same_day() -> Result<Option<NaiveDate>, ()> {
        Ok(NaiveDate::from_ymd_opt(2023, 10, 6))
    }

    fn funded_pdf(id: ArticleId) -> Vec<(String, &'static str)> {
        vec![(format!("files/{id}/main.pdf"), "This work is Funded by SCOAP3.")]
    }

    #[tokio::test]
    async fn all_rules_pass_for_a_clean_article() {
        let store = MemoryCatalog::new();
        let id = seed(&store, Seed::default()).await;
        let report = engine(&store, same_day(), &funded_pdf(id))
            .evaluate(id)
            .await
            .unwrap()
            .unwrap();

        for (name, outcome) in report.checks.named() {
            assert!(outcome.passed, "{name} failed: {}", outcome.description);
        }
        assert!(report.compliant);
        assert_eq!(
            report.checks.arxiv_category.description,
            "ArXiv category compliance not applicable."
        );
    }

    #[tokio::test]
    async fn editorial_title_fails_only_article_type() {
        let store = MemoryCatalog::new();
        let id = seed(
            &store,
            Seed {
                title: "Test editorial Article",
                ..Default::default()
            },
        )
        .await;
        let report = engine(&store, same_day(), &funded_pdf(id))
            .evaluate(id)
            .await
            .unwrap()
            .unwrap();

        assert!(!report.compliant);
        assert!(!report.checks.article_type.passed);
        assert!(report.checks.article_type.description.contains("Editorial"));
        let others_pass = report
            .checks
            .named()
            .iter()
            .filter(|(name, _)| *name != "article_type")
            .all(|(_, outcome)| outcome.passed);
        assert!(others_pass);
    }

    #[tokio::test]
    async fn three_day_doi_delay_fails() {
        let store = MemoryCatalog::new();
        let id = seed(&store, Seed::default()).await;
        let report = engine(&store, Ok(NaiveDate::from_ymd_opt(2023, 10, 3)), &funded_pdf(id))
            .evaluate(id)
            .await
            .unwrap()
            .unwrap();

        assert!(!report.checks.doi_registration_time.passed);
        assert!(report.checks.doi_registration_time.description.contains('3'));
        assert!(!report.compliant);
    }

    #[tokio::test]
    async fn registry_failure_degrades_one_rule() {
        let store = MemoryCatalog::new();
        let id = seed(&store, Seed::default()).await;
        let report = engine(&store, Err(()), &funded_pdf(id))
            .evaluate(id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            report.checks.doi_registration_time.description,
            "DOI registration date not found."
        );
        assert!(report.checks.license.passed);
        assert!(report.checks.funded_by_scoap3.passed);
    }

    #[tokio::test]
    async fn no_files_fails_funding_independently_of_formats() {
        let store = MemoryCatalog::new();
        let id = seed(
            &store,
            Seed {
                files: vec![],
                ..Default::default()
            },
        )
        .await;
        let report = engine(&store, same_day(), &[]).evaluate(id).await.unwrap().unwrap();

        assert_eq!(
            report.checks.funded_by_scoap3.description,
            "No files found for the given article."
        );
        assert_eq!(
            report.checks.required_file_formats.description,
            "Missing required file formats: pdf, pdf/a, xml."
        );
    }

    #[tokio::test]
    async fn missing_file_on_disk_is_a_failure() {
        let store = MemoryCatalog::new();
        let id = seed(&store, Seed::default()).await;
        let report = engine(&store, same_day(), &[]).evaluate(id).await.unwrap().unwrap();

        assert!(!report.checks.funded_by_scoap3.passed);
        assert!(report
            .checks
            .funded_by_scoap3
            .description
            .contains(&format!("files/{id}/main.pdf")));
    }

    #[tokio::test]
    async fn unaffiliated_author_fails() {
        let store = MemoryCatalog::new();
        let id = seed(
            &store,
            Seed {
                with_affiliation: false,
                ..Default::default()
            },
        )
        .await;
        let report = engine(&store, same_day(), &funded_pdf(id))
            .evaluate(id)
            .await
            .unwrap()
            .unwrap();
        assert!(!report.checks.authors_affiliation.passed);
        assert!(!report.compliant);
    }

    #[tokio::test]
    async fn reevaluation_replaces_the_report() {
        let store = MemoryCatalog::new();
        let id = seed(&store, Seed::default()).await;
        let engine = engine(&store, same_day(), &funded_pdf(id));

        let first = engine.evaluate(id).await.unwrap().unwrap();
        let second = engine.evaluate(id).await.unwrap().unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(store.counts().await.compliance_reports, 1);
        assert_eq!(store.compliance_report(id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn unknown_article_is_not_found() {
        let store = MemoryCatalog::new();
        let engine = engine(&store, same_day(), &[]);
        assert_eq!(engine.evaluate(404).await.unwrap(), None);
        assert_eq!(store.counts().await.compliance_reports, 0);
    }

    #[tokio::test]
    async fn bulk_evaluation_sorts_outcomes() {
        let store = MemoryCatalog::new();
        let clean = seed(&store, Seed::default()).await;
        let erratum = seed(
            &store,
            Seed {
                title: "Erratum to: a paper",
                ..Default::default()
            },
        )
        .await;
        let mut texts = funded_pdf(clean);
        texts.extend(funded_pdf(erratum));

        let summary = engine(&store, same_day(), &texts)
            .evaluate_many(&[clean, erratum, 999])
            .await;
        assert_eq!(summary.compliant, vec![clean]);
        assert_eq!(summary.non_compliant, vec![erratum]);
        assert_eq!(summary.not_found, vec![999]);
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn mark_compliant_overrides_failed_reports() {
        let store = MemoryCatalog::new();
        let failing = seed(
            &store,
            Seed {
                title: "Corrigendum",
                ..Default::default()
            },
        )
        .await;
        let unevaluated = seed(&store, Seed::default()).await;
        let engine = engine(&store, same_day(), &funded_pdf(failing));

        assert!(!engine.evaluate(failing).await.unwrap().unwrap().compliant);
        let touched = engine.mark_compliant(&[failing, unevaluated]).await.unwrap();

        assert_eq!(touched, vec![failing]);
        assert!(store.compliance_report(failing).await.unwrap().unwrap().compliant);
        assert_eq!(store.compliance_report(unevaluated).await.unwrap(), None);
    }
}
