use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use scoap_adapters::load_payload_file;
use scoap_compliance::{ComplianceEngine, CompliancePolicy, DoiLookupError, DoiRegistry, FileTextScanner, ScanError};
use scoap_core::IdentifierType;
use scoap_storage::{CatalogStore, FsRecordStore, MemoryCatalog, RecordStore};
use scoap_sync::{
    drive_backfill, BackfillKind, CountryResolver, DispatchError, ErrorTracker, ImportOptions, Importer,
    SyncTaskHandler, Task, TaskDispatcher, TaskQueue, WorkerConfig, WorkerPool,
};
use serde_json::Value as JsonValue;
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture(name: &str) -> JsonValue {
    load_payload_file(workspace_root().join("fixtures").join(name)).unwrap()
}

fn with_files() -> ImportOptions {
    ImportOptions { include_files: true }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Task>>);

#[async_trait]
impl TaskDispatcher for Recorder {
    async fn submit(&self, task: Task) -> Result<(), DispatchError> {
        self.0.lock().unwrap().push(task);
        Ok(())
    }
}

#[derive(Default)]
struct Captured(Mutex<Vec<String>>);

impl ErrorTracker for Captured {
    fn capture(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

struct RegisteredSameDay;

#[async_trait]
impl DoiRegistry for RegisteredSameDay {
    async fn registration_date(&self, _doi: &str) -> Result<Option<NaiveDate>, DoiLookupError> {
        Ok(NaiveDate::from_ymd_opt(2019, 6, 20))
    }
}

struct NoFiles;

#[async_trait]
impl FileTextScanner for NoFiles {
    async fn contains_text(&self, file_path: &str, _needle: &str) -> Result<bool, ScanError> {
        Err(ScanError::NotFound(file_path.to_string()))
    }
}

fn importer(store: &MemoryCatalog) -> Importer {
    Importer::new(Arc::new(store.clone()), CountryResolver::default())
}

#[tokio::test]
async fn reimporting_the_same_payload_changes_nothing() {
    let store = MemoryCatalog::new();
    let importer = importer(&store);
    let payload = fixture("workflow/sample.json");

    let first = importer.import_payload(&payload, with_files()).await.unwrap();
    let counts = store.counts().await;
    let second = importer.import_payload(&payload, with_files()).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(store.counts().await, counts);
    assert_eq!(counts.articles, 1);
    assert_eq!(counts.authors, 2);
    assert_eq!(counts.files, 3);
    assert_eq!(counts.collaborations, 1);
}

#[tokio::test]
async fn a_known_doi_updates_the_existing_article() {
    let store = MemoryCatalog::new();
    let importer = importer(&store);
    let mut payload = fixture("workflow/sample.json");
    let first = importer.import_payload(&payload, ImportOptions::default()).await.unwrap();

    payload["titles"][0]["title"] = "Charged lepton flavour violation (corrected)".into();
    payload["arxiv_eprints"][0]["value"] = "2309.01234v2".into();
    let second = importer.import_payload(&payload, ImportOptions::default()).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(store.counts().await.articles, 1);
    assert_eq!(second.article.fields.title, "Charged lepton flavour violation (corrected)");
    assert_eq!(second.first_identifier(IdentifierType::Arxiv), Some("2309.01234v2"));
    assert_eq!(second.dois(), vec!["10.1016/j.physletb.2023.138173"]);
}

#[tokio::test]
async fn explicit_ids_are_kept_and_advance_the_sequence() {
    let store = MemoryCatalog::new();
    let importer = importer(&store);

    let legacy = importer
        .import_payload(&fixture("legacy/sample.json"), ImportOptions::default())
        .await
        .unwrap();
    let workflow = importer
        .import_payload(&fixture("workflow/sample.json"), ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(legacy.id(), 43571);
    assert!(workflow.id() > 43571);
}

#[tokio::test]
async fn a_renamed_author_is_recorded_as_a_new_row() {
    let store = MemoryCatalog::new();
    let importer = importer(&store);
    let mut payload = fixture("workflow/sample.json");
    importer.import_payload(&payload, ImportOptions::default()).await.unwrap();

    payload["authors"][1]["surname"] = "Yıldız".into();
    importer.import_payload(&payload, ImportOptions::default()).await.unwrap();

    assert_eq!(store.counts().await.authors, 3);
}

#[tokio::test]
async fn workflow_affiliations_resolve_countries_and_ror() {
    let store = MemoryCatalog::new();
    let aggregate = importer(&store)
        .import_payload(&fixture("workflow/sample.json"), ImportOptions::default())
        .await
        .unwrap();

    let novak = &aggregate.authors[0];
    assert_eq!(novak.author.last_name, "Novak");
    assert_eq!(novak.identifiers[0].identifier_value, "0000-0002-1825-0097");
    let cern = &novak.affiliations[0];
    assert_eq!(cern.country.as_ref().map(|c| c.code.as_str()), Some("CERN"));
    assert_eq!(cern.institution_identifiers[0].identifier_value, "https://ror.org/01ggx4157");

    let yilmaz = &aggregate.authors[1];
    let country = yilmaz.affiliations[0].country.as_ref().unwrap();
    assert_eq!((country.code.as_str(), country.name.as_str()), ("TR", "Türkiye"));
}

#[tokio::test]
async fn a_country_name_held_by_another_code_does_not_block_the_import() {
    let store = MemoryCatalog::new();
    let mut tx = store.begin().await.unwrap();
    tx.get_or_create_country("XT", "Türkiye").await.unwrap();
    tx.commit().await.unwrap();

    let aggregate = importer(&store)
        .import_payload(&fixture("workflow/sample.json"), ImportOptions::default())
        .await
        .unwrap();

    let yilmaz = &aggregate.authors[1];
    let country = yilmaz.affiliations[0].country.as_ref().unwrap();
    assert_eq!((country.code.as_str(), country.name.as_str()), ("TR", "Türkiye"));
    assert_eq!(store.counts().await.countries, 3);
}

#[tokio::test]
async fn legacy_record_keeps_unresolved_affiliations_without_a_country() {
    let store = MemoryCatalog::new();
    let tracker = Arc::new(Captured::default());
    let importer = Importer::new(Arc::new(store.clone()), CountryResolver::new(tracker.clone()));

    let aggregate = importer
        .import_payload(&fixture("legacy/sample.json"), with_files())
        .await
        .unwrap();

    let tanaka = &aggregate.authors[0];
    assert_eq!(tanaka.affiliations.len(), 2);
    assert_eq!(tanaka.affiliations[0].country.as_ref().map(|c| c.code.as_str()), Some("JP"));
    assert!(tanaka.affiliations[1].country.is_none());
    assert!(aggregate.authors[1].affiliations.is_empty());
    assert!(tracker.0.lock().unwrap().is_empty());

    let paths: Vec<&str> = aggregate.files.iter().map(|f| f.file_path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["files/43571/10.1093/ptep/ptz058.pdf", "files/43571/10.1093/ptep/ptz058.xml"]
    );
}

#[tokio::test]
async fn volume_year_falls_back_to_creation_and_is_retained() {
    let store = MemoryCatalog::new();
    let importer = importer(&store);

    let legacy = importer
        .import_payload(&fixture("legacy/sample.json"), ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(legacy.publication_info[0].info.fields.volume_year.as_deref(), Some("2019"));
    assert_eq!(legacy.publication_info[0].publisher.name, "OUP");

    let mut payload = fixture("workflow/sample.json");
    let first = importer.import_payload(&payload, ImportOptions::default()).await.unwrap();
    assert_eq!(first.publication_info[0].info.fields.volume_year.as_deref(), Some("2023"));

    payload["publication_info"][0]
        .as_object_mut()
        .unwrap()
        .remove("year");
    let second = importer.import_payload(&payload, ImportOptions::default()).await.unwrap();
    assert_eq!(second.publication_info[0].info.fields.volume_year.as_deref(), Some("2023"));
}

#[tokio::test]
async fn a_shorter_publication_info_list_drops_the_extra_rows() {
    let store = MemoryCatalog::new();
    let importer = importer(&store);
    let mut payload = fixture("workflow/sample.json");
    let erratum = serde_json::json!({"journal_title": "Physics Letters B", "journal_volume": "848", "year": 2024});
    payload["publication_info"].as_array_mut().unwrap().push(erratum);
    payload["imprints"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({"publisher": "Elsevier", "date": "2024-01-10"}));

    let first = importer.import_payload(&payload, ImportOptions::default()).await.unwrap();
    assert_eq!(first.publication_info.len(), 2);

    payload["publication_info"].as_array_mut().unwrap().truncate(1);
    payload["imprints"].as_array_mut().unwrap().truncate(1);
    let second = importer.import_payload(&payload, ImportOptions::default()).await.unwrap();

    assert_eq!(second.publication_info.len(), 1);
    assert_eq!(second.publication_info[0].info.id, first.publication_info[0].info.id);
    assert_eq!(second.publication_info[0].info.fields.journal_volume, "846");
    assert_eq!(store.counts().await.publication_info, 1);
}

#[tokio::test]
async fn licenses_are_canonicalized_and_shared() {
    let store = MemoryCatalog::new();
    let importer = importer(&store);
    let legacy = importer
        .import_payload(&fixture("legacy/sample.json"), ImportOptions::default())
        .await
        .unwrap();
    importer
        .import_payload(&fixture("workflow/sample.json"), ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(legacy.licenses[0].name, "CC-BY-3.0");
    assert_eq!(legacy.licenses[0].url, "https://creativecommons.org/licenses/by/3.0/");
    assert_eq!(store.counts().await.licenses, 2);
}

#[tokio::test]
async fn a_successful_import_publishes_a_compliance_task() {
    let store = MemoryCatalog::new();
    let recorder = Arc::new(Recorder::default());
    let importer = importer(&store).with_dispatcher(recorder.clone());

    let aggregate = importer
        .import_payload(&fixture("workflow/sample.json"), ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(
        *recorder.0.lock().unwrap(),
        vec![Task::EvaluateCompliance {
            article_id: aggregate.id()
        }]
    );
}

#[tokio::test]
async fn invalid_payloads_publish_nothing() {
    let store = MemoryCatalog::new();
    let recorder = Arc::new(Recorder::default());
    let importer = importer(&store).with_dispatcher(recorder.clone());

    let mut payload = fixture("workflow/sample.json");
    payload["dois"] = serde_json::json!([]);
    assert!(importer.import_payload(&payload, ImportOptions::default()).await.is_err());
    assert!(recorder.0.lock().unwrap().is_empty());
    assert_eq!(store.counts().await.articles, 0);
}

#[tokio::test]
async fn backfill_imports_every_record_and_evaluates_each_article() {
    let dir = tempdir().unwrap();
    let records = FsRecordStore::new(dir.path());
    for (key, name) in [
        ("legacy/0001.json", "legacy/sample.json"),
        ("legacy/0002.json", "workflow/sample.json"),
    ] {
        let bytes = std::fs::read(workspace_root().join("fixtures").join(name)).unwrap();
        records.put(key, &bytes).await.unwrap();
    }
    let records: Arc<dyn RecordStore> = Arc::new(records);

    let store = MemoryCatalog::new();
    let catalog: Arc<dyn CatalogStore> = Arc::new(store.clone());
    let (queue, receiver) = TaskQueue::new();
    let importer = Arc::new(Importer::new(catalog.clone(), CountryResolver::default()).with_dispatcher(queue.clone()));
    let compliance = Arc::new(ComplianceEngine::new(
        catalog,
        CompliancePolicy::from_workspace_root(&workspace_root()).unwrap(),
        Arc::new(RegisteredSameDay),
        Arc::new(NoFiles),
    ));
    let handler = Arc::new(SyncTaskHandler::new(importer, compliance, records.clone()));
    let pool = WorkerPool::start(queue.clone(), receiver, handler, WorkerConfig::default());

    let plan = drive_backfill(records.as_ref(), queue.as_ref(), BackfillKind::Import, "legacy/", 1)
        .await
        .unwrap();
    pool.shutdown().await;

    assert_eq!(plan.ranges, vec![(0, 1), (1, 2)]);
    let counts = store.counts().await;
    assert_eq!(counts.articles, 2);
    assert_eq!(counts.compliance_reports, 2);

    let report = store.compliance_report(43571).await.unwrap().unwrap();
    assert!(!report.compliant);
    assert!(!report.checks.article_type.passed);
    assert_eq!(report.checks.article_type.description, "Article is of non-compliant type: Erratum.");
    assert!(report.checks.doi_registration_time.passed);
    assert!(!report.checks.funded_by_scoap3.passed);
}

#[tokio::test]
async fn affiliation_backfill_skips_records_that_were_never_imported() {
    let dir = tempdir().unwrap();
    let records = FsRecordStore::new(dir.path());
    let bytes = std::fs::read(workspace_root().join("fixtures/legacy/sample.json")).unwrap();
    records.put("legacy/0001.json", &bytes).await.unwrap();

    let store = MemoryCatalog::new();
    let importer = importer(&store);
    let summary = scoap_sync::link_affiliations_range(&importer, &records, "legacy/", 0, 1)
        .await
        .unwrap();
    assert_eq!((summary.processed, summary.skipped), (0, 1));

    importer
        .import_payload(&serde_json::from_slice(&bytes).unwrap(), ImportOptions::default())
        .await
        .unwrap();
    let links = store.counts().await.author_affiliations;
    let summary = scoap_sync::link_affiliations_range(&importer, &records, "legacy/", 0, 1)
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(store.counts().await.author_affiliations, links);
}
