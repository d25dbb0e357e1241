//! Bulk re-ingestion of record corpora in `[lower, upper)` slices of the sorted key listing.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use scoap_adapters::parse_payload_bytes;
use scoap_compliance::ComplianceEngine;
use scoap_storage::RecordStore;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::importer::{ImportOptions, Importer};
use crate::tasks::{Task, TaskDispatcher, TaskHandler};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillKind {
    Import,
    LinkAffiliations,
}

impl BackfillKind {
    fn task(self, prefix: &str, lower: usize, upper: usize) -> Task {
        let prefix = prefix.to_string();
        match self {
            Self::Import => Task::ImportRange { prefix, lower, upper },
            Self::LinkAffiliations => Task::LinkAffiliations { prefix, lower, upper },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillPlan {
    pub kind: BackfillKind,
    pub prefix: String,
    pub total_records: usize,
    pub ranges: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RangeSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Half-open windows of at most `batch_size` covering `0..total`.
pub fn partition(total: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    (0..total)
        .step_by(batch_size)
        .map(|lower| (lower, (lower + batch_size).min(total)))
        .collect()
}

/// Lists the records under `prefix` and submits one unit of work per window.
pub async fn drive_backfill(
    records: &dyn RecordStore,
    dispatcher: &dyn TaskDispatcher,
    kind: BackfillKind,
    prefix: &str,
    batch_size: usize,
) -> anyhow::Result<BackfillPlan> {
    let keys = records
        .list(prefix)
        .await
        .with_context(|| format!("listing records under {prefix:?}"))?;
    let ranges = partition(keys.len(), batch_size);
    for &(lower, upper) in &ranges {
        dispatcher
            .submit(kind.task(prefix, lower, upper))
            .await?;
    }
    info!(?kind, prefix, records = keys.len(), units = ranges.len(), "backfill dispatched");
    Ok(BackfillPlan {
        kind,
        prefix: prefix.to_string(),
        total_records: keys.len(),
        ranges,
    })
}

async fn slice_keys(records: &dyn RecordStore, prefix: &str, lower: usize, upper: usize) -> anyhow::Result<Vec<String>> {
    let keys = records
        .list(prefix)
        .await
        .with_context(|| format!("listing records under {prefix:?}"))?;
    let upper = upper.min(keys.len());
    let lower = lower.min(upper);
    Ok(keys[lower..upper].to_vec())
}

/// Imports every record in the window. A failing record is logged and counted; the rest continue.
pub async fn import_range(
    importer: &Importer,
    records: &dyn RecordStore,
    prefix: &str,
    lower: usize,
    upper: usize,
) -> anyhow::Result<RangeSummary> {
    let mut summary = RangeSummary::default();
    for key in slice_keys(records, prefix, lower, upper).await? {
        let outcome = match records.read(&key).await {
            Ok(bytes) => importer
                .import_bytes(&bytes, ImportOptions { include_files: true })
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => summary.processed += 1,
            Err(err) => {
                error!(key = %key, error = %err, "record import failed");
                summary.failed += 1;
            }
        }
    }
    info!(prefix, lower, upper, processed = summary.processed, failed = summary.failed, "import range done");
    Ok(summary)
}

/// Re-links author affiliations for the window's records; records with no imported article are skipped.
pub async fn link_affiliations_range(
    importer: &Importer,
    records: &dyn RecordStore,
    prefix: &str,
    lower: usize,
    upper: usize,
) -> anyhow::Result<RangeSummary> {
    let mut summary = RangeSummary::default();
    for key in slice_keys(records, prefix, lower, upper).await? {
        let draft = match records.read(&key).await.and_then(|bytes| Ok(parse_payload_bytes(&bytes)?)) {
            Ok(draft) => draft,
            Err(err) => {
                error!(key = %key, error = %err, "record unreadable");
                summary.failed += 1;
                continue;
            }
        };
        match importer.link_affiliations(&draft).await {
            Ok(Some(_)) => summary.processed += 1,
            Ok(None) => {
                warn!(key = %key, "no article for record; affiliations not linked");
                summary.skipped += 1;
            }
            Err(err) => {
                error!(key = %key, error = %err, "affiliation linking failed");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Executes every [`Task`] kind against the import and compliance services.
pub struct SyncTaskHandler {
    importer: Arc<Importer>,
    compliance: Arc<ComplianceEngine>,
    records: Arc<dyn RecordStore>,
}

impl SyncTaskHandler {
    pub fn new(importer: Arc<Importer>, compliance: Arc<ComplianceEngine>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            importer,
            compliance,
            records,
        }
    }
}

#[async_trait]
impl TaskHandler for SyncTaskHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        match task {
            Task::EvaluateCompliance { article_id } => {
                if self.compliance.evaluate(*article_id).await?.is_none() {
                    warn!(article_id, "article vanished before compliance evaluation");
                }
            }
            Task::ImportRange { prefix, lower, upper } => {
                import_range(&self.importer, self.records.as_ref(), prefix, *lower, *upper).await?;
            }
            Task::LinkAffiliations { prefix, lower, upper } => {
                link_affiliations_range(&self.importer, self.records.as_ref(), prefix, *lower, *upper).await?;
            }
        }
        Ok(())
    }
}
