//! JSON surface over record import and compliance evaluation.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use scoap_compliance::{ComplianceEngine, ComplianceError};
use scoap_core::{ArticleAggregate, ArticleId};
use scoap_storage::{CatalogStore, StoreError};
use scoap_sync::{ImportError, ImportOptions, Importer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "scoap-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
    pub importer: Arc<Importer>,
    pub compliance: Arc<ComplianceEngine>,
}

impl AppState {
    pub fn new(store: Arc<dyn CatalogStore>, importer: Arc<Importer>, compliance: Arc<ComplianceEngine>) -> Self {
        Self {
            store,
            importer,
            compliance,
        }
    }
}

/// Workflow pushes record their files unless told otherwise.
#[derive(Debug, Deserialize)]
pub struct ImportQuery {
    #[serde(default = "default_include_files")]
    pub include_files: bool,
}

impl Default for ImportQuery {
    fn default() -> Self {
        Self {
            include_files: default_include_files(),
        }
    }
}

fn default_include_files() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ArticleSelection {
    pub article_ids: Vec<ArticleId>,
}

#[derive(Debug, Serialize)]
struct MarkedCompliant {
    marked: Vec<ArticleId>,
}

/// Error body: `{"message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "message": self.message }))).into_response()
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        let status = match err {
            ImportError::Conflict(_) => StatusCode::CONFLICT,
            ImportError::Validation(_) | ImportError::Store(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ComplianceError> for ApiError {
    fn from(err: ComplianceError) -> Self {
        error!(error = %err, "compliance evaluation failed");
        Self::internal(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "catalog read failed");
        Self::internal(err.to_string())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/workflow-import", post(import_handler))
        .route("/api/articles/{id}", get(article_handler))
        .route(
            "/api/articles/{id}/compliance",
            get(compliance_report_handler).post(evaluate_handler),
        )
        .route("/api/compliance/evaluate", post(bulk_evaluate_handler))
        .route("/api/compliance/mark-compliant", post(mark_compliant_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImportQuery>,
    Json(payload): Json<JsonValue>,
) -> Result<Json<ArticleAggregate>, ApiError> {
    let options = ImportOptions {
        include_files: query.include_files,
    };
    match state.importer.import_payload(&payload, options).await {
        Ok(aggregate) => Ok(Json(aggregate)),
        Err(err) => {
            warn!(error = %err, "import rejected");
            Err(err.into())
        }
    }
}

async fn article_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<ArticleId>,
) -> Result<Json<ArticleAggregate>, ApiError> {
    let mut tx = state.store.begin().await?;
    let aggregate = tx.load_aggregate(id).await?;
    tx.commit().await?;
    aggregate
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("article {id} not found")))
}

async fn compliance_report_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<ArticleId>,
) -> Response {
    match state.store.compliance_report(id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => ApiError::not_found(format!("no compliance report for article {id}")).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn evaluate_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<ArticleId>) -> Response {
    match state.compliance.evaluate(id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => ApiError::not_found(format!("article {id} not found")).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn bulk_evaluate_handler(
    State(state): State<Arc<AppState>>,
    Json(selection): Json<ArticleSelection>,
) -> impl IntoResponse {
    Json(state.compliance.evaluate_many(&selection.article_ids).await)
}

async fn mark_compliant_handler(
    State(state): State<Arc<AppState>>,
    Json(selection): Json<ArticleSelection>,
) -> Result<Json<MarkedCompliant>, ApiError> {
    let marked = state.compliance.mark_compliant(&selection.article_ids).await?;
    Ok(Json(MarkedCompliant { marked }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use scoap_compliance::{CompliancePolicy, DoiLookupError, DoiRegistry, FileTextScanner, ScanError};
    use scoap_storage::MemoryCatalog;
    use scoap_sync::CountryResolver;
    use tower::ServiceExt;

    struct Unregistered;

    #[async_trait]
    impl DoiRegistry for Unregistered {
        async fn registration_date(&self, _doi: &str) -> Result<Option<NaiveDate>, DoiLookupError> {
            Ok(None)
        }
    }

    struct EmptyFiles;

    #[async_trait]
    impl FileTextScanner for EmptyFiles {
        async fn contains_text(&self, _file_path: &str, _needle: &str) -> Result<bool, ScanError> {
            Ok(false)
        }
    }

    fn state() -> AppState {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::new());
        let importer = Arc::new(Importer::new(store.clone(), CountryResolver::default()));
        let compliance = Arc::new(ComplianceEngine::new(
            store.clone(),
            CompliancePolicy::default(),
            Arc::new(Unregistered),
            Arc::new(EmptyFiles),
        ));
        AppState::new(store, importer, compliance)
    }

    fn payload() -> JsonValue {
        serde_json::json!({
            "titles": [{"title": "Search for dark photons"}],
            "dois": [{"value": "10.1016/j.nuclphysb.2024.116500"}],
            "authors": [{"given_names": "Ana", "surname": "Novak", "affiliations": [
                {"value": "CERN, Geneva", "organization": "CERN", "country": "CERN"}
            ]}],
            "license": [{"license": "CC-BY-4.0", "url": "https://creativecommons.org/licenses/by/4.0/"}]
        })
    }

    fn post_json(uri: &str, body: &JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn import_returns_the_article_representation() {
        let app = app(state());
        let resp = app.oneshot(post_json("/api/workflow-import", &payload())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["title"], "Search for dark photons");
        assert_eq!(body["identifiers"][0]["identifier_value"], "10.1016/j.nuclphysb.2024.116500");
        assert_eq!(body["authors"][0]["affiliations"][0]["country"]["code"], "CERN");
    }

    fn workflow_fixture() -> JsonValue {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/workflow/sample.json");
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn workflow_push_records_its_files_by_default() {
        let app = app(state());
        let resp = app
            .clone()
            .oneshot(post_json("/api/workflow-import", &workflow_fixture()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let id = body["id"].as_i64().unwrap();
        let mut paths: Vec<&str> = body["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["file_path"].as_str().unwrap())
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                format!("files/{id}/main.pdf"),
                format!("files/{id}/main.xml"),
                format!("files/{id}/main_a-2b.pdf"),
            ]
        );

        let opted_out = app
            .oneshot(post_json("/api/workflow-import?include_files=false", &workflow_fixture()))
            .await
            .unwrap();
        assert_eq!(opted_out.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_payload_is_a_structured_400() {
        let app = app(state());
        let resp = app
            .oneshot(post_json("/api/workflow-import", &serde_json::json!({"titles": []})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[tokio::test]
    async fn compliance_round_trip_through_the_routes() {
        let app = app(state());
        let imported = json_body(
            app.clone()
                .oneshot(post_json("/api/workflow-import", &payload()))
                .await
                .unwrap(),
        )
        .await;
        let id = imported["id"].as_i64().unwrap();

        let missing = app
            .clone()
            .oneshot(get(&format!("/api/articles/{id}/compliance")))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let evaluated = app
            .clone()
            .oneshot(post_json(&format!("/api/articles/{id}/compliance"), &JsonValue::Null))
            .await
            .unwrap();
        assert_eq!(evaluated.status(), StatusCode::OK);
        let report = json_body(evaluated).await;
        assert_eq!(report["compliant"], false);
        assert_eq!(
            report["checks"]["doi_registration_time"]["description"],
            "DOI registration date not found."
        );

        let marked = app
            .clone()
            .oneshot(post_json(
                "/api/compliance/mark-compliant",
                &serde_json::json!({"article_ids": [id, 999]}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(marked).await["marked"], serde_json::json!([id]));

        let stored = app
            .oneshot(get(&format!("/api/articles/{id}/compliance")))
            .await
            .unwrap();
        assert_eq!(json_body(stored).await["compliant"], true);
    }

    #[tokio::test]
    async fn unknown_article_is_404() {
        let app = app(state());
        let resp = app.clone().oneshot(get("/api/articles/77")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(post_json("/api/compliance/evaluate", &serde_json::json!({"article_ids": [77]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["not_found"], serde_json::json!([77]));
    }
}
