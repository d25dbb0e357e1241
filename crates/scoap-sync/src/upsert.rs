//! Merge of article-owned child rows under a [`MergePolicy`].

use scoap_core::{
    ArticleId, ArticleIdentifier, CopyrightFields, IdentifierType, PublicationInfo,
    PublicationInfoFields,
};
use scoap_storage::{CatalogTx, MergePolicy, StoreResult};

/// What to do with one incoming child given the rows the article already owns.
#[derive(Debug, PartialEq, Eq)]
pub enum MergeStep<'a, T> {
    Insert,
    Update(&'a T),
    Unchanged(&'a T),
}

/// `existing` holds the candidate rows: every row of the kind for [`MergePolicy::Additive`], the
/// slot being replaced for [`MergePolicy::ReplaceInPlace`]. `same` says whether a row already
/// carries the incoming values.
pub fn plan_merge<'a, T>(
    policy: MergePolicy,
    existing: &'a [T],
    same: impl Fn(&T) -> bool,
) -> MergeStep<'a, T> {
    match policy {
        MergePolicy::Additive => match existing.iter().find(|&row| same(row)) {
            Some(row) => MergeStep::Unchanged(row),
            None => MergeStep::Insert,
        },
        MergePolicy::ReplaceInPlace => match existing.first() {
            Some(row) if same(row) => MergeStep::Unchanged(row),
            Some(row) => MergeStep::Update(row),
            None => MergeStep::Insert,
        },
    }
}

fn of_type(existing: &[ArticleIdentifier], kind: IdentifierType) -> Vec<ArticleIdentifier> {
    existing
        .iter()
        .filter(|i| i.identifier_type == kind)
        .cloned()
        .collect()
}

/// DOIs accumulate; a value the article already carries is a no-op.
pub async fn upsert_doi(
    tx: &mut dyn CatalogTx,
    article_id: ArticleId,
    existing: &[ArticleIdentifier],
    doi: &str,
) -> StoreResult<()> {
    let dois = of_type(existing, IdentifierType::Doi);
    if let MergeStep::Insert = plan_merge(MergePolicy::Additive, &dois, |row| row.identifier_value == doi) {
        tx.insert_identifier(article_id, IdentifierType::Doi, doi).await?;
    }
    Ok(())
}

/// The article keeps a single current arXiv id, overwritten in place.
pub async fn upsert_arxiv_id(
    tx: &mut dyn CatalogTx,
    article_id: ArticleId,
    existing: &[ArticleIdentifier],
    arxiv_id: &str,
) -> StoreResult<()> {
    let current = of_type(existing, IdentifierType::Arxiv);
    match plan_merge(MergePolicy::ReplaceInPlace, &current, |row| row.identifier_value == arxiv_id) {
        MergeStep::Insert => {
            tx.insert_identifier(article_id, IdentifierType::Arxiv, arxiv_id).await?;
        }
        MergeStep::Update(row) => tx.update_identifier_value(row.id, arxiv_id).await?,
        MergeStep::Unchanged(_) => {}
    }
    Ok(())
}

pub async fn upsert_copyright(
    tx: &mut dyn CatalogTx,
    article_id: ArticleId,
    fields: &CopyrightFields,
) -> StoreResult<()> {
    let existing = tx.list_copyrights(article_id).await?;
    match plan_merge(MergePolicy::ReplaceInPlace, &existing, |row| row.fields == *fields) {
        MergeStep::Insert => {
            tx.insert_copyright(article_id, fields).await?;
        }
        MergeStep::Update(row) => {
            let mut row = row.clone();
            row.fields = fields.clone();
            tx.update_copyright(&row).await?;
        }
        MergeStep::Unchanged(_) => {}
    }
    Ok(())
}

/// Publication info is matched by position: `slot` is the row already stored at the incoming index.
pub async fn upsert_publication_info(
    tx: &mut dyn CatalogTx,
    article_id: ArticleId,
    slot: Option<&PublicationInfo>,
    publisher_id: i64,
    fields: &PublicationInfoFields,
) -> StoreResult<()> {
    let slot = slot.map(std::slice::from_ref).unwrap_or_default();
    let same = |row: &PublicationInfo| row.publisher_id == publisher_id && row.fields == *fields;
    match plan_merge(MergePolicy::ReplaceInPlace, slot, same) {
        MergeStep::Insert => {
            tx.insert_publication_info(article_id, publisher_id, fields).await?;
        }
        MergeStep::Update(row) => {
            let mut row = row.clone();
            row.publisher_id = publisher_id;
            row.fields = fields.clone();
            tx.update_publication_info(&row).await?;
        }
        MergeStep::Unchanged(_) => {}
    }
    Ok(())
}
