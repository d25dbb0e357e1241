use std::collections::HashMap;

use async_trait::async_trait;
use scoap_core::{
    Affiliation, AffiliationView, Article, ArticleAggregate, ArticleFields, ArticleFile,
    ArticleId, ArticleIdentifier, ArxivCategory, Author, AuthorIdentifier, AuthorView,
    ComplianceChecks, ComplianceReport, Copyright, CopyrightFields, Country,
    ExperimentalCollaboration, IdentifierType, InstitutionIdentifier, License, NewAffiliation,
    NewArticle, NewAuthor, NewComplianceReport, PublicationInfo, PublicationInfoFields,
    PublicationInfoView, Publisher, RuleOutcome,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use crate::catalog::{CatalogStore, CatalogTx, StoreError, StoreResult};

const ARTICLE_COLUMNS: &str = "id, reception_date, acceptance_date, publication_date, \
     first_online_date, title, subtitle, abstract, created_at, updated_at";

const REPORT_COLUMNS: &str = "id, article_id, report_date, \
     check_license, check_license_description, \
     check_required_file_formats, check_required_file_formats_description, \
     check_article_type, check_article_type_description, \
     check_arxiv_category, check_arxiv_category_description, \
     check_doi_registration_time, check_doi_registration_time_description, \
     check_authors_affiliation, check_authors_affiliation_description, \
     check_funded_by_scoap3, check_funded_by_scoap3_description, compliant";

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn begin(&self) -> StoreResult<Box<dyn CatalogTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn restart_article_sequence(&self, next_id: ArticleId) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE article IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        let max_id: i64 = sqlx::query("SELECT COALESCE(MAX(id), 0) AS max_id FROM article")
            .fetch_one(&mut *tx)
            .await?
            .try_get("max_id")?;
        if next_id <= max_id {
            return Err(StoreError::Invalid(format!(
                "next article id {next_id} must be greater than the current maximum {max_id}"
            )));
        }
        sqlx::query("SELECT setval('article_id_seq', $1, false)")
            .bind(next_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn compliance_report(&self, article_id: ArticleId) -> StoreResult<Option<ComplianceReport>> {
        let row = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM compliance_report WHERE article_id = $1"
        ))
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(report_from_row).transpose()
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

/// A get-or-create statement that returned nothing lost a race with a concurrent writer.
fn raced(row: Option<PgRow>, entity: &str) -> StoreResult<PgRow> {
    row.ok_or_else(|| StoreError::Conflict(format!("{entity} was created concurrently")))
}

fn article_from_row(row: &PgRow) -> StoreResult<Article> {
    Ok(Article {
        id: row.try_get("id")?,
        fields: ArticleFields {
            reception_date: row.try_get("reception_date")?,
            acceptance_date: row.try_get("acceptance_date")?,
            publication_date: row.try_get("publication_date")?,
            first_online_date: row.try_get("first_online_date")?,
            title: row.try_get("title")?,
            subtitle: row.try_get("subtitle")?,
            abstract_text: row.try_get("abstract")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn identifier_from_row(row: &PgRow) -> StoreResult<ArticleIdentifier> {
    let kind: String = row.try_get("identifier_type")?;
    let identifier_type = IdentifierType::parse(&kind)
        .ok_or_else(|| StoreError::Invalid(format!("unknown identifier type {kind}")))?;
    Ok(ArticleIdentifier {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        identifier_type,
        identifier_value: row.try_get("identifier_value")?,
    })
}

fn copyright_from_row(row: &PgRow) -> StoreResult<Copyright> {
    Ok(Copyright {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        fields: CopyrightFields {
            statement: row.try_get("statement")?,
            holder: row.try_get("holder")?,
            year: row.try_get("year")?,
        },
    })
}

fn category_from_row(row: &PgRow) -> StoreResult<ArxivCategory> {
    Ok(ArxivCategory {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        category: row.try_get("category")?,
        primary: row.try_get("is_primary")?,
    })
}

fn publication_info_from_row(row: &PgRow) -> StoreResult<PublicationInfo> {
    Ok(PublicationInfo {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        publisher_id: row.try_get("publisher_id")?,
        fields: PublicationInfoFields {
            journal_title: row.try_get("journal_title")?,
            journal_volume: row.try_get("journal_volume")?,
            journal_issue: row.try_get("journal_issue")?,
            page_start: row.try_get("page_start")?,
            page_end: row.try_get("page_end")?,
            artid: row.try_get("artid")?,
            volume_year: row.try_get("volume_year")?,
            journal_issue_date: row.try_get("journal_issue_date")?,
        },
    })
}

fn author_from_row(row: &PgRow) -> StoreResult<Author> {
    Ok(Author {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        author_order: row.try_get("author_order")?,
    })
}

fn affiliation_from_row(row: &PgRow) -> StoreResult<Affiliation> {
    Ok(Affiliation {
        id: row.try_get("id")?,
        value: row.try_get("value")?,
        organization: row.try_get("organization")?,
        country_code: row.try_get("country_code")?,
    })
}

fn outcome(row: &PgRow, column: &str) -> StoreResult<RuleOutcome> {
    Ok(RuleOutcome {
        passed: row.try_get(column)?,
        description: row.try_get(format!("{column}_description").as_str())?,
    })
}

fn report_from_row(row: &PgRow) -> StoreResult<ComplianceReport> {
    Ok(ComplianceReport {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        report_date: row.try_get("report_date")?,
        checks: ComplianceChecks {
            license: outcome(row, "check_license")?,
            required_file_formats: outcome(row, "check_required_file_formats")?,
            article_type: outcome(row, "check_article_type")?,
            arxiv_category: outcome(row, "check_arxiv_category")?,
            doi_registration_time: outcome(row, "check_doi_registration_time")?,
            authors_affiliation: outcome(row, "check_authors_affiliation")?,
            funded_by_scoap3: outcome(row, "check_funded_by_scoap3")?,
        },
        compliant: row.try_get("compliant")?,
    })
}

#[async_trait]
impl CatalogTx for PgTx {
    async fn lock_natural_key(&mut self, key: &str) -> StoreResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_or_create_country(&mut self, code: &str, name: &str) -> StoreResult<Country> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO country (code, name) VALUES ($1, $2)
                ON CONFLICT (code) DO NOTHING
                RETURNING code, name
            )
            SELECT code, name FROM ins
            UNION ALL
            SELECT code, name FROM country WHERE code = $1
            LIMIT 1
            "#,
        )
        .bind(code)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = raced(row, "country")?;
        Ok(Country {
            code: row.try_get("code")?,
            name: row.try_get("name")?,
        })
    }

    async fn get_or_create_license(&mut self, url: &str, name: &str) -> StoreResult<License> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO license (url, name) VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                RETURNING id, url, name
            )
            SELECT id, url, name FROM ins
            UNION ALL
            SELECT id, url, name FROM license WHERE url = $1 AND name = $2
            LIMIT 1
            "#,
        )
        .bind(url)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = raced(row, "license")?;
        Ok(License {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            name: row.try_get("name")?,
        })
    }

    async fn get_or_create_publisher(&mut self, name: &str) -> StoreResult<Publisher> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO publisher (name) VALUES ($1)
                ON CONFLICT DO NOTHING
                RETURNING id, name
            )
            SELECT id, name FROM ins
            UNION ALL
            SELECT id, name FROM publisher WHERE name = $1
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = raced(row, "publisher")?;
        Ok(Publisher {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    async fn get_or_create_collaboration(&mut self, name: &str) -> StoreResult<ExperimentalCollaboration> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO experimental_collaboration (name) VALUES ($1)
                ON CONFLICT DO NOTHING
                RETURNING id, name
            )
            SELECT id, name FROM ins
            UNION ALL
            SELECT id, name FROM experimental_collaboration WHERE name = $1
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = raced(row, "experimental collaboration")?;
        Ok(ExperimentalCollaboration {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    async fn get_or_create_affiliation(&mut self, key: &NewAffiliation) -> StoreResult<Affiliation> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO affiliation (value, organization, country_code) VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                RETURNING id, value, organization, country_code
            )
            SELECT id, value, organization, country_code FROM ins
            UNION ALL
            SELECT id, value, organization, country_code
              FROM affiliation
             WHERE value = $1
               AND organization = $2
               AND country_code IS NOT DISTINCT FROM $3
            LIMIT 1
            "#,
        )
        .bind(&key.value)
        .bind(&key.organization)
        .bind(&key.country_code)
        .fetch_optional(&mut *self.tx)
        .await?;
        affiliation_from_row(&raced(row, "affiliation")?)
    }

    async fn get_or_create_institution_identifier(
        &mut self,
        affiliation_id: i64,
        identifier_type: &str,
        value: &str,
    ) -> StoreResult<InstitutionIdentifier> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO institution_identifier (affiliation_id, identifier_type, identifier_value)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                RETURNING id, affiliation_id, identifier_type, identifier_value
            )
            SELECT id, affiliation_id, identifier_type, identifier_value FROM ins
            UNION ALL
            SELECT id, affiliation_id, identifier_type, identifier_value
              FROM institution_identifier
             WHERE affiliation_id = $1 AND identifier_type = $2 AND identifier_value = $3
            LIMIT 1
            "#,
        )
        .bind(affiliation_id)
        .bind(identifier_type)
        .bind(value)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = raced(row, "institution identifier")?;
        Ok(InstitutionIdentifier {
            id: row.try_get("id")?,
            affiliation_id: row.try_get("affiliation_id")?,
            identifier_type: row.try_get("identifier_type")?,
            identifier_value: row.try_get("identifier_value")?,
        })
    }

    async fn link_author_affiliation(&mut self, author_id: i64, affiliation_id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO author_affiliation (author_id, affiliation_id) VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(author_id)
        .bind(affiliation_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_article_by_identifier(
        &mut self,
        kind: IdentifierType,
        value: &str,
    ) -> StoreResult<Option<ArticleId>> {
        let row = sqlx::query(
            r#"
            SELECT article_id
              FROM article_identifier
             WHERE identifier_type = $1 AND identifier_value = $2
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(value)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|r| r.try_get::<ArticleId, _>("article_id")).transpose()?)
    }

    async fn lock_article(&mut self, id: ArticleId) -> StoreResult<Option<Article>> {
        let row = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM article WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn insert_article(&mut self, new: &NewArticle) -> StoreResult<Article> {
        let row = match new.id {
            Some(id) => {
                let exists = sqlx::query("SELECT 1 FROM article WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await?
                    .is_some();
                if exists {
                    return Err(StoreError::Duplicate {
                        entity: "article",
                        key: id.to_string(),
                    });
                }
                let row = sqlx::query(&format!(
                    r#"
                    INSERT INTO article (id, reception_date, acceptance_date, publication_date,
                                         first_online_date, title, subtitle, abstract,
                                         created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
                    RETURNING {ARTICLE_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(new.fields.reception_date)
                .bind(new.fields.acceptance_date)
                .bind(new.fields.publication_date)
                .bind(new.fields.first_online_date)
                .bind(&new.fields.title)
                .bind(&new.fields.subtitle)
                .bind(&new.fields.abstract_text)
                .bind(new.created_at)
                .fetch_one(&mut *self.tx)
                .await?;
                sqlx::query(
                    r#"
                    SELECT setval('article_id_seq', $1, true)
                      FROM article_id_seq
                     WHERE $1 >= CASE WHEN is_called THEN last_value + 1 ELSE last_value END
                    "#,
                )
                .bind(id)
                .execute(&mut *self.tx)
                .await?;
                row
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    INSERT INTO article (reception_date, acceptance_date, publication_date,
                                         first_online_date, title, subtitle, abstract,
                                         created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
                    RETURNING {ARTICLE_COLUMNS}
                    "#
                ))
                .bind(new.fields.reception_date)
                .bind(new.fields.acceptance_date)
                .bind(new.fields.publication_date)
                .bind(new.fields.first_online_date)
                .bind(&new.fields.title)
                .bind(&new.fields.subtitle)
                .bind(&new.fields.abstract_text)
                .bind(new.created_at)
                .fetch_one(&mut *self.tx)
                .await?
            }
        };
        article_from_row(&row)
    }

    async fn update_article(&mut self, article: &Article) -> StoreResult<Article> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE article
               SET reception_date = $2,
                   acceptance_date = $3,
                   publication_date = $4,
                   first_online_date = $5,
                   title = $6,
                   subtitle = $7,
                   abstract = $8,
                   created_at = $9,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {ARTICLE_COLUMNS}
            "#
        ))
        .bind(article.id)
        .bind(article.fields.reception_date)
        .bind(article.fields.acceptance_date)
        .bind(article.fields.publication_date)
        .bind(article.fields.first_online_date)
        .bind(&article.fields.title)
        .bind(&article.fields.subtitle)
        .bind(&article.fields.abstract_text)
        .bind(article.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        match row {
            Some(row) => article_from_row(&row),
            None => Err(StoreError::NotFound {
                entity: "article",
                key: article.id.to_string(),
            }),
        }
    }

    async fn set_article_licenses(&mut self, article_id: ArticleId, license_ids: &[i64]) -> StoreResult<()> {
        sqlx::query("DELETE FROM article_license WHERE article_id = $1")
            .bind(article_id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO article_license (article_id, license_id)
            SELECT $1, license_id FROM UNNEST($2::BIGINT[]) AS t(license_id)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(article_id)
        .bind(license_ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_or_create_file(
        &mut self,
        article_id: ArticleId,
        file_path: &str,
        filetype: Option<&str>,
    ) -> StoreResult<ArticleFile> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO article_file (article_id, file_path, filetype) VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                RETURNING id, article_id, file_path, filetype
            )
            SELECT id, article_id, file_path, filetype FROM ins
            UNION ALL
            SELECT id, article_id, file_path, filetype
              FROM article_file
             WHERE article_id = $1 AND file_path = $2
            LIMIT 1
            "#,
        )
        .bind(article_id)
        .bind(file_path)
        .bind(filetype)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = raced(row, "article file")?;
        Ok(ArticleFile {
            id: row.try_get("id")?,
            article_id: row.try_get("article_id")?,
            file_path: row.try_get("file_path")?,
            filetype: row.try_get("filetype")?,
        })
    }

    async fn list_identifiers(&mut self, article_id: ArticleId) -> StoreResult<Vec<ArticleIdentifier>> {
        let rows = sqlx::query(
            r#"
            SELECT id, article_id, identifier_type, identifier_value
              FROM article_identifier
             WHERE article_id = $1
             ORDER BY id
            "#,
        )
        .bind(article_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(identifier_from_row).collect()
    }

    async fn insert_identifier(
        &mut self,
        article_id: ArticleId,
        kind: IdentifierType,
        value: &str,
    ) -> StoreResult<ArticleIdentifier> {
        let row = sqlx::query(
            r#"
            INSERT INTO article_identifier (article_id, identifier_type, identifier_value)
            VALUES ($1, $2, $3)
            RETURNING id, article_id, identifier_type, identifier_value
            "#,
        )
        .bind(article_id)
        .bind(kind.as_str())
        .bind(value)
        .fetch_one(&mut *self.tx)
        .await?;
        identifier_from_row(&row)
    }

    async fn update_identifier_value(&mut self, identifier_id: i64, value: &str) -> StoreResult<()> {
        sqlx::query("UPDATE article_identifier SET identifier_value = $2 WHERE id = $1")
            .bind(identifier_id)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn list_copyrights(&mut self, article_id: ArticleId) -> StoreResult<Vec<Copyright>> {
        let rows = sqlx::query(
            "SELECT id, article_id, statement, holder, year FROM copyright WHERE article_id = $1 ORDER BY id",
        )
        .bind(article_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(copyright_from_row).collect()
    }

    async fn insert_copyright(&mut self, article_id: ArticleId, fields: &CopyrightFields) -> StoreResult<Copyright> {
        let row = sqlx::query(
            r#"
            INSERT INTO copyright (article_id, statement, holder, year)
            VALUES ($1, $2, $3, $4)
            RETURNING id, article_id, statement, holder, year
            "#,
        )
        .bind(article_id)
        .bind(&fields.statement)
        .bind(&fields.holder)
        .bind(fields.year)
        .fetch_one(&mut *self.tx)
        .await?;
        copyright_from_row(&row)
    }

    async fn update_copyright(&mut self, copyright: &Copyright) -> StoreResult<()> {
        sqlx::query("UPDATE copyright SET statement = $2, holder = $3, year = $4 WHERE id = $1")
            .bind(copyright.id)
            .bind(&copyright.fields.statement)
            .bind(&copyright.fields.holder)
            .bind(copyright.fields.year)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn replace_arxiv_categories(
        &mut self,
        article_id: ArticleId,
        categories: &[(String, bool)],
    ) -> StoreResult<Vec<ArxivCategory>> {
        sqlx::query("DELETE FROM article_arxiv_category WHERE article_id = $1")
            .bind(article_id)
            .execute(&mut *self.tx)
            .await?;
        let mut stored = Vec::with_capacity(categories.len());
        for (category, primary) in categories {
            let row = sqlx::query(
                r#"
                INSERT INTO article_arxiv_category (article_id, category, is_primary)
                VALUES ($1, $2, $3)
                RETURNING id, article_id, category, is_primary
                "#,
            )
            .bind(article_id)
            .bind(category)
            .bind(*primary)
            .fetch_one(&mut *self.tx)
            .await?;
            stored.push(category_from_row(&row)?);
        }
        Ok(stored)
    }

    async fn list_publication_info(&mut self, article_id: ArticleId) -> StoreResult<Vec<PublicationInfo>> {
        let rows = sqlx::query("SELECT * FROM publication_info WHERE article_id = $1 ORDER BY id")
            .bind(article_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(publication_info_from_row).collect()
    }

    async fn insert_publication_info(
        &mut self,
        article_id: ArticleId,
        publisher_id: i64,
        fields: &PublicationInfoFields,
    ) -> StoreResult<PublicationInfo> {
        let row = sqlx::query(
            r#"
            INSERT INTO publication_info (article_id, publisher_id, journal_title, journal_volume,
                                          journal_issue, page_start, page_end, artid,
                                          volume_year, journal_issue_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(article_id)
        .bind(publisher_id)
        .bind(&fields.journal_title)
        .bind(&fields.journal_volume)
        .bind(&fields.journal_issue)
        .bind(&fields.page_start)
        .bind(&fields.page_end)
        .bind(&fields.artid)
        .bind(&fields.volume_year)
        .bind(fields.journal_issue_date)
        .fetch_one(&mut *self.tx)
        .await?;
        publication_info_from_row(&row)
    }

    async fn update_publication_info(&mut self, info: &PublicationInfo) -> StoreResult<()> {
        let fields = &info.fields;
        sqlx::query(
            r#"
            UPDATE publication_info
               SET publisher_id = $2,
                   journal_title = $3,
                   journal_volume = $4,
                   journal_issue = $5,
                   page_start = $6,
                   page_end = $7,
                   artid = $8,
                   volume_year = $9,
                   journal_issue_date = $10
             WHERE id = $1
            "#,
        )
        .bind(info.id)
        .bind(info.publisher_id)
        .bind(&fields.journal_title)
        .bind(&fields.journal_volume)
        .bind(&fields.journal_issue)
        .bind(&fields.page_start)
        .bind(&fields.page_end)
        .bind(&fields.artid)
        .bind(&fields.volume_year)
        .bind(fields.journal_issue_date)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_publication_info(&mut self, ids: &[i64]) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM publication_info WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_or_create_author(&mut self, key: &NewAuthor) -> StoreResult<Author> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO author (article_id, first_name, last_name, email, author_order)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT DO NOTHING
                RETURNING id, article_id, first_name, last_name, email, author_order
            )
            SELECT id, article_id, first_name, last_name, email, author_order FROM ins
            UNION ALL
            SELECT id, article_id, first_name, last_name, email, author_order
              FROM author
             WHERE article_id = $1
               AND first_name = $2
               AND last_name = $3
               AND email IS NOT DISTINCT FROM $4
               AND author_order = $5
            LIMIT 1
            "#,
        )
        .bind(key.article_id)
        .bind(&key.first_name)
        .bind(&key.last_name)
        .bind(&key.email)
        .bind(key.author_order)
        .fetch_optional(&mut *self.tx)
        .await?;
        author_from_row(&raced(row, "author")?)
    }

    async fn get_or_create_author_identifier(
        &mut self,
        author_id: i64,
        identifier_type: &str,
        value: &str,
    ) -> StoreResult<AuthorIdentifier> {
        let row = sqlx::query(
            r#"
            WITH ins AS (
                INSERT INTO author_identifier (author_id, identifier_type, identifier_value)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                RETURNING id, author_id, identifier_type, identifier_value
            )
            SELECT id, author_id, identifier_type, identifier_value FROM ins
            UNION ALL
            SELECT id, author_id, identifier_type, identifier_value
              FROM author_identifier
             WHERE author_id = $1 AND identifier_type = $2 AND identifier_value = $3
            LIMIT 1
            "#,
        )
        .bind(author_id)
        .bind(identifier_type)
        .bind(value)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = raced(row, "author identifier")?;
        Ok(AuthorIdentifier {
            id: row.try_get("id")?,
            author_id: row.try_get("author_id")?,
            identifier_type: row.try_get("identifier_type")?,
            identifier_value: row.try_get("identifier_value")?,
        })
    }

    async fn load_aggregate(&mut self, id: ArticleId) -> StoreResult<Option<ArticleAggregate>> {
        let Some(row) = sqlx::query(&format!("SELECT {ARTICLE_COLUMNS} FROM article WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
        else {
            return Ok(None);
        };
        let article = article_from_row(&row)?;
        let identifiers = self.list_identifiers(id).await?;

        let files = sqlx::query(
            "SELECT id, article_id, file_path, filetype FROM article_file WHERE article_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(|row| -> StoreResult<ArticleFile> {
            Ok(ArticleFile {
                id: row.try_get("id")?,
                article_id: row.try_get("article_id")?,
                file_path: row.try_get("file_path")?,
                filetype: row.try_get("filetype")?,
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

        let licenses = sqlx::query(
            r#"
            SELECT l.id, l.url, l.name
              FROM license l
              JOIN article_license al ON al.license_id = l.id
             WHERE al.article_id = $1
             ORDER BY l.id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(|row| -> StoreResult<License> {
            Ok(License {
                id: row.try_get("id")?,
                url: row.try_get("url")?,
                name: row.try_get("name")?,
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

        let copyrights = self.list_copyrights(id).await?;

        let arxiv_categories = sqlx::query(
            "SELECT id, article_id, category, is_primary FROM article_arxiv_category WHERE article_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(category_from_row)
        .collect::<StoreResult<Vec<_>>>()?;

        let publication_info = sqlx::query(
            r#"
            SELECT pi.*, p.name AS publisher_name
              FROM publication_info pi
              JOIN publisher p ON p.id = pi.publisher_id
             WHERE pi.article_id = $1
             ORDER BY pi.id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(|row| -> StoreResult<PublicationInfoView> {
            let info = publication_info_from_row(row)?;
            let publisher = Publisher {
                id: info.publisher_id,
                name: row.try_get("publisher_name")?,
            };
            Ok(PublicationInfoView { info, publisher })
        })
        .collect::<StoreResult<Vec<_>>>()?;

        let authors = self.load_author_views(id).await?;

        Ok(Some(ArticleAggregate {
            article,
            identifiers,
            files,
            licenses,
            copyrights,
            arxiv_categories,
            publication_info,
            authors,
        }))
    }

    async fn replace_compliance_report(&mut self, report: &NewComplianceReport) -> StoreResult<ComplianceReport> {
        sqlx::query("DELETE FROM compliance_report WHERE article_id = $1")
            .bind(report.article_id)
            .execute(&mut *self.tx)
            .await?;
        let checks = &report.checks;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO compliance_report (
                article_id, report_date,
                check_license, check_license_description,
                check_required_file_formats, check_required_file_formats_description,
                check_article_type, check_article_type_description,
                check_arxiv_category, check_arxiv_category_description,
                check_doi_registration_time, check_doi_registration_time_description,
                check_authors_affiliation, check_authors_affiliation_description,
                check_funded_by_scoap3, check_funded_by_scoap3_description,
                compliant
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {REPORT_COLUMNS}
            "#
        ))
        .bind(report.article_id)
        .bind(report.report_date)
        .bind(checks.license.passed)
        .bind(&checks.license.description)
        .bind(checks.required_file_formats.passed)
        .bind(&checks.required_file_formats.description)
        .bind(checks.article_type.passed)
        .bind(&checks.article_type.description)
        .bind(checks.arxiv_category.passed)
        .bind(&checks.arxiv_category.description)
        .bind(checks.doi_registration_time.passed)
        .bind(&checks.doi_registration_time.description)
        .bind(checks.authors_affiliation.passed)
        .bind(&checks.authors_affiliation.description)
        .bind(checks.funded_by_scoap3.passed)
        .bind(&checks.funded_by_scoap3.description)
        .bind(report.compliant())
        .fetch_one(&mut *self.tx)
        .await?;
        report_from_row(&row)
    }

    async fn mark_reports_compliant(&mut self, article_ids: &[ArticleId]) -> StoreResult<Vec<ArticleId>> {
        let rows = sqlx::query(
            r#"
            UPDATE compliance_report
               SET compliant = TRUE
             WHERE article_id = ANY($1)
            RETURNING article_id
            "#,
        )
        .bind(article_ids)
        .fetch_all(&mut *self.tx)
        .await?;
        let mut touched = rows
            .iter()
            .map(|row| row.try_get("article_id"))
            .collect::<Result<Vec<ArticleId>, _>>()?;
        touched.sort_unstable();
        touched.dedup();
        Ok(touched)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl PgTx {
    async fn load_author_views(&mut self, article_id: ArticleId) -> StoreResult<Vec<AuthorView>> {
        let authors = sqlx::query(
            r#"
            SELECT id, article_id, first_name, last_name, email, author_order
              FROM author
             WHERE article_id = $1
             ORDER BY author_order, id
            "#,
        )
        .bind(article_id)
        .fetch_all(&mut *self.tx)
        .await?
        .iter()
        .map(author_from_row)
        .collect::<StoreResult<Vec<_>>>()?;
        let author_ids: Vec<i64> = authors.iter().map(|a| a.id).collect();

        let mut identifiers: HashMap<i64, Vec<AuthorIdentifier>> = HashMap::new();
        for row in sqlx::query(
            r#"
            SELECT id, author_id, identifier_type, identifier_value
              FROM author_identifier
             WHERE author_id = ANY($1)
             ORDER BY id
            "#,
        )
        .bind(&author_ids)
        .fetch_all(&mut *self.tx)
        .await?
        {
            let identifier = AuthorIdentifier {
                id: row.try_get("id")?,
                author_id: row.try_get("author_id")?,
                identifier_type: row.try_get("identifier_type")?,
                identifier_value: row.try_get("identifier_value")?,
            };
            identifiers.entry(identifier.author_id).or_default().push(identifier);
        }

        let mut links: Vec<(i64, Affiliation, Option<Country>)> = Vec::new();
        for row in sqlx::query(
            r#"
            SELECT aa.author_id, a.id, a.value, a.organization, a.country_code,
                   c.name AS country_name
              FROM author_affiliation aa
              JOIN affiliation a ON a.id = aa.affiliation_id
              LEFT JOIN country c ON c.code = a.country_code
             WHERE aa.author_id = ANY($1)
             ORDER BY aa.id
            "#,
        )
        .bind(&author_ids)
        .fetch_all(&mut *self.tx)
        .await?
        {
            let affiliation = affiliation_from_row(&row)?;
            let country_name: Option<String> = row.try_get("country_name")?;
            let country = affiliation
                .country_code
                .clone()
                .zip(country_name)
                .map(|(code, name)| Country { code, name });
            links.push((row.try_get("author_id")?, affiliation, country));
        }

        let affiliation_ids: Vec<i64> = links.iter().map(|(_, a, _)| a.id).collect();
        let mut institution_ids: HashMap<i64, Vec<InstitutionIdentifier>> = HashMap::new();
        for row in sqlx::query(
            r#"
            SELECT id, affiliation_id, identifier_type, identifier_value
              FROM institution_identifier
             WHERE affiliation_id = ANY($1)
             ORDER BY id
            "#,
        )
        .bind(&affiliation_ids)
        .fetch_all(&mut *self.tx)
        .await?
        {
            let identifier = InstitutionIdentifier {
                id: row.try_get("id")?,
                affiliation_id: row.try_get("affiliation_id")?,
                identifier_type: row.try_get("identifier_type")?,
                identifier_value: row.try_get("identifier_value")?,
            };
            institution_ids
                .entry(identifier.affiliation_id)
                .or_default()
                .push(identifier);
        }

        Ok(authors
            .into_iter()
            .map(|author| {
                let affiliations = links
                    .iter()
                    .filter(|(author_id, _, _)| *author_id == author.id)
                    .map(|(_, affiliation, country)| AffiliationView {
                        institution_identifiers: institution_ids
                            .get(&affiliation.id)
                            .cloned()
                            .unwrap_or_default(),
                        country: country.clone(),
                        affiliation: affiliation.clone(),
                    })
                    .collect();
                AuthorView {
                    identifiers: identifiers.remove(&author.id).unwrap_or_default(),
                    affiliations,
                    author,
                }
            })
            .collect())
    }
}
