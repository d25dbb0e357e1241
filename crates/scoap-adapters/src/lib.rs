//! Payload adapters: shape detection and parsing of external article records into `RecordDraft`s.

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scoap_core::{
    AffiliationDraft, ArticleId, AuthorDraft, CopyrightFields, FileDraft, ImprintDraft,
    LicenseDraft, PayloadShape, PublicationInfoDraft, RecordDraft,
};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "scoap-adapters";

/// Download endpoint of the predecessor repository; legacy `_files` entries are addressed by bucket and key.
pub const LEGACY_FILES_BASE_URL: &str = "https://repo.scoap3.org/api/files";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Invalid(String),
    #[error("payload matches no known record shape")]
    UnknownShape,
}

impl AdapterError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

pub trait PayloadAdapter: Send + Sync {
    fn shape(&self) -> PayloadShape;
    fn matches(&self, payload: &JsonValue) -> bool;
    fn parse(&self, payload: &JsonValue) -> Result<RecordDraft, AdapterError>;
}

/// Records pushed by the harvesting workflow: files arrive as a `{filetype: url}` map.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkflowAdapter;

/// Records exported in bulk from the predecessor system, carrying `_files` and `_created`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyAdapter;

impl PayloadAdapter for WorkflowAdapter {
    fn shape(&self) -> PayloadShape {
        PayloadShape::Workflow
    }

    fn matches(&self, payload: &JsonValue) -> bool {
        payload.is_object()
    }

    fn parse(&self, payload: &JsonValue) -> Result<RecordDraft, AdapterError> {
        let mut draft = parse_common(payload, PayloadShape::Workflow)?;
        draft.created_at = json_str(payload, &["_created_at"]).and_then(parse_timestamp);
        if let Some(files) = payload.get("files").and_then(JsonValue::as_object) {
            for (filetype, url) in files {
                let Some(url) = url.as_str().map(str::trim).filter(|u| !u.is_empty()) else {
                    continue;
                };
                draft.files.push(FileDraft {
                    name: relative_file_key(file_name_from_url(url))?,
                    filetype: Some(normalize_filetype(filetype)),
                    source_url: Some(url.to_string()),
                });
            }
        }
        Ok(draft)
    }
}

impl PayloadAdapter for LegacyAdapter {
    fn shape(&self) -> PayloadShape {
        PayloadShape::Legacy
    }

    fn matches(&self, payload: &JsonValue) -> bool {
        payload.get("_files").is_some() || payload.get("_created").is_some()
    }

    fn parse(&self, payload: &JsonValue) -> Result<RecordDraft, AdapterError> {
        let mut draft = parse_common(payload, PayloadShape::Legacy)?;
        draft.created_at = json_str(payload, &["_created"]).and_then(parse_timestamp);
        for file in json_array(payload, "_files") {
            let Some(key) = json_text(file, &["key"]) else {
                continue;
            };
            let key = relative_file_key(&key)?;
            let source_url = json_text(file, &["bucket"])
                .map(|bucket| format!("{LEGACY_FILES_BASE_URL}/{bucket}/{key}"));
            draft.files.push(FileDraft {
                filetype: json_text(file, &["filetype"]).map(|t| normalize_filetype(&t)),
                name: key,
                source_url,
            });
        }
        Ok(draft)
    }
}

/// Pick the adapter for a payload. Legacy is tried first since workflow accepts any object.
pub fn adapter_for_payload(payload: &JsonValue) -> Option<Box<dyn PayloadAdapter>> {
    let candidates: [Box<dyn PayloadAdapter>; 2] = [Box::new(LegacyAdapter), Box::new(WorkflowAdapter)];
    candidates.into_iter().find(|adapter| adapter.matches(payload))
}

pub fn adapter_for_shape(shape: PayloadShape) -> Box<dyn PayloadAdapter> {
    match shape {
        PayloadShape::Workflow => Box::new(WorkflowAdapter),
        PayloadShape::Legacy => Box::new(LegacyAdapter),
    }
}

pub fn parse_payload(payload: &JsonValue) -> Result<RecordDraft, AdapterError> {
    adapter_for_payload(payload)
        .ok_or(AdapterError::UnknownShape)?
        .parse(payload)
}

pub fn parse_payload_bytes(bytes: &[u8]) -> Result<RecordDraft, AdapterError> {
    let payload: JsonValue = serde_json::from_slice(bytes)
        .map_err(|err| AdapterError::invalid(format!("payload is not valid JSON: {err}")))?;
    parse_payload(&payload)
}

pub fn load_payload_file(path: impl AsRef<Path>) -> anyhow::Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn parse_common(payload: &JsonValue, shape: PayloadShape) -> Result<RecordDraft, AdapterError> {
    if !payload.is_object() {
        return Err(AdapterError::invalid("payload must be a JSON object"));
    }
    let mut draft = RecordDraft::empty(shape);

    draft.article_id = parse_article_id(payload)?;

    let title = first(payload, "titles").and_then(|t| json_text(t, &["title"]));
    draft.fields.title = title.ok_or_else(|| AdapterError::invalid("record has no title"))?;
    draft.fields.subtitle = first(payload, "titles")
        .and_then(|t| json_text(t, &["subtitle"]))
        .unwrap_or_default();
    draft.fields.abstract_text = first(payload, "abstracts")
        .and_then(|a| json_text(a, &["value"]))
        .unwrap_or_default();

    for doi in json_array(payload, "dois").iter().filter_map(|d| json_text(d, &["value"])) {
        if !draft.dois.contains(&doi) {
            draft.dois.push(doi);
        }
    }
    if draft.dois.is_empty() {
        return Err(AdapterError::invalid("record has no DOI"));
    }

    for eprint in json_array(payload, "arxiv_eprints") {
        if let Some(value) = json_text(eprint, &["value"]) {
            draft.arxiv_ids.push(value);
        }
    }
    if let Some(eprint) = first(payload, "arxiv_eprints") {
        draft.arxiv_categories = json_array(eprint, "categories")
            .iter()
            .filter_map(|c| c.as_str().map(str::trim).filter(|c| !c.is_empty()))
            .map(ToString::to_string)
            .collect();
    }

    draft.licenses = json_array(payload, "license")
        .iter()
        .filter_map(parse_license)
        .collect();

    draft.copyrights = json_array(payload, "copyright")
        .iter()
        .map(|c| CopyrightFields {
            statement: json_text(c, &["statement"]).unwrap_or_default(),
            holder: json_text(c, &["holder"]).unwrap_or_default(),
            year: json_text(c, &["year"]).and_then(|y| y.parse().ok()),
        })
        .collect();

    draft.imprints = json_array(payload, "imprints")
        .iter()
        .filter_map(|i| {
            Some(ImprintDraft {
                publisher: json_text(i, &["publisher"])?,
                date: json_str(i, &["date"]).and_then(parse_date),
            })
        })
        .collect();
    draft.fields.publication_date = draft.imprints.first().and_then(|i| i.date);
    draft.fields.first_online_date = json_str(payload, &["record_creation_date"]).and_then(parse_date);

    draft.publication_info = json_array(payload, "publication_info")
        .iter()
        .map(|p| PublicationInfoDraft {
            journal_title: json_text(p, &["journal_title"]).unwrap_or_default(),
            journal_volume: json_text(p, &["journal_volume"]).unwrap_or_default(),
            journal_issue: json_text(p, &["journal_issue"]).unwrap_or_default(),
            page_start: json_text(p, &["page_start"]).unwrap_or_default(),
            page_end: json_text(p, &["page_end"]).unwrap_or_default(),
            artid: json_text(p, &["artid"]).unwrap_or_default(),
            year: json_text(p, &["year"]),
        })
        .collect();

    draft.collaborations = json_array(payload, "collaborations")
        .iter()
        .filter_map(|c| json_text(c, &["value"]))
        .collect();

    draft.authors = json_array(payload, "authors").iter().map(parse_author).collect();

    Ok(draft)
}

fn parse_article_id(payload: &JsonValue) -> Result<Option<ArticleId>, AdapterError> {
    let Some(raw) = payload.get("control_number").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let id = match raw {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match id {
        Some(id) if id > 0 => Ok(Some(id)),
        _ => Err(AdapterError::invalid(format!("control_number {raw} is not a positive integer"))),
    }
}

fn parse_license(entry: &JsonValue) -> Option<LicenseDraft> {
    let draft = match entry {
        JsonValue::String(name) => LicenseDraft {
            url: None,
            name: Some(name.trim().to_string()).filter(|n| !n.is_empty()),
        },
        JsonValue::Object(_) => LicenseDraft {
            url: json_text(entry, &["url"]),
            name: json_text(entry, &["license"]),
        },
        _ => return None,
    };
    (draft.url.is_some() || draft.name.is_some()).then_some(draft)
}

fn parse_author(author: &JsonValue) -> AuthorDraft {
    let orcid = json_text(author, &["orcid"]).or_else(|| {
        json_array(author, "ids")
            .iter()
            .find(|id| json_str(id, &["schema"]).is_some_and(|s| s.eq_ignore_ascii_case("orcid")))
            .and_then(|id| json_text(id, &["value"]))
    });
    AuthorDraft {
        first_name: json_text(author, &["given_names"]).unwrap_or_default(),
        last_name: json_text(author, &["surname"]).unwrap_or_default(),
        email: json_text(author, &["email"]),
        orcid,
        affiliations: json_array(author, "affiliations")
            .iter()
            .filter_map(|a| {
                let value = json_text(a, &["value"]).unwrap_or_default();
                let organization = json_text(a, &["organization"]).unwrap_or_default();
                if value.is_empty() && organization.is_empty() {
                    return None;
                }
                Some(AffiliationDraft {
                    value,
                    organization,
                    country: json_text(a, &["country"]),
                    ror: json_text(a, &["ror"]),
                })
            })
            .collect(),
    }
}

fn normalize_filetype(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "pdfa" | "pdf_a" => "pdf/a".to_string(),
        _ => lowered,
    }
}

/// File names end up under `files/{article_id}/`; keys may nest but must stay below it.
fn relative_file_key(key: &str) -> Result<String, AdapterError> {
    let escapes = key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if escapes {
        return Err(AdapterError::invalid(format!("file key {key:?} is not a relative path")));
    }
    Ok(key.to_string())
}

fn file_name_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').find(|segment| !segment.is_empty()).unwrap_or(path)
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Trimmed, non-empty text at `path`; numbers are rendered as text.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    let text = match json_at(value, path)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn json_array<'a>(value: &'a JsonValue, key: &str) -> &'a [JsonValue] {
    value
        .get(key)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn first<'a>(value: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
    json_array(value, key).first()
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    parse_date(text)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture(path: &str) -> JsonValue {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        load_payload_file(root.join("fixtures").join(path)).unwrap()
    }

    fn minimal() -> JsonValue {
        json!({
            "titles": [{"title": "A title"}],
            "dois": [{"value": "10.1/abc"}]
        })
    }

    #[test]
    fn workflow_fixture_parses_every_section() {
        let payload = fixture("workflow/sample.json");
        let adapter = adapter_for_payload(&payload).unwrap();
        assert_eq!(adapter.shape(), PayloadShape::Workflow);

        let draft = adapter.parse(&payload).unwrap();
        assert_eq!(draft.dois, vec!["10.1016/j.physletb.2023.138173"]);
        assert_eq!(draft.arxiv_ids, vec!["2309.01234"]);
        assert_eq!(draft.arxiv_categories, vec!["hep-ph", "hep-ex"]);
        assert_eq!(draft.article_id, None);
        assert_eq!(draft.authors.len(), 2);
        assert_eq!(draft.authors[0].orcid.as_deref(), Some("0000-0002-1825-0097"));
        assert_eq!(draft.authors[1].email, None);
        assert_eq!(draft.authors[1].affiliations[0].country.as_deref(), Some("Turkey"));
        assert_eq!(draft.publication_info[0].year.as_deref(), Some("2023"));
        assert_eq!(draft.copyrights[0].year, Some(2023));
        assert_eq!(draft.collaborations, vec!["ATLAS"]);
        assert_eq!(
            draft.fields.publication_date,
            NaiveDate::from_ymd_opt(2023, 10, 5)
        );

        let types: Vec<_> = draft.files.iter().filter_map(|f| f.filetype.as_deref()).collect();
        assert_eq!(types, vec!["pdf", "pdf/a", "xml"]);
        assert_eq!(draft.files[0].name, "main.pdf");
    }

    #[test]
    fn legacy_fixture_keeps_control_number_and_file_keys() {
        let payload = fixture("legacy/sample.json");
        let draft = parse_payload(&payload).unwrap();

        assert_eq!(draft.shape, PayloadShape::Legacy);
        assert_eq!(draft.article_id, Some(43571));
        let created = draft.created_at.unwrap();
        assert_eq!(created.date_naive(), NaiveDate::from_ymd_opt(2019, 6, 20).unwrap());
        assert_eq!(draft.files[0].name, "10.1093/ptep/ptz058.pdf");
        assert_eq!(
            draft.files[0].source_url.as_deref(),
            Some("https://repo.scoap3.org/api/files/3b9a6c2e-1f4d-4c1e-9d6a-5d1c2a3b4c5d/10.1093/ptep/ptz058.pdf")
        );
        assert_eq!(draft.publication_info[0].year, None);
        assert_eq!(draft.copyrights[0].year, Some(2019));
        assert!(draft.authors[1].affiliations.is_empty());
    }

    #[test]
    fn file_keys_that_leave_the_article_directory_are_rejected() {
        for key in ["../../etc/passwd", "/etc/passwd", "a/../../b.pdf", "a//b.pdf", "..\\b.pdf"] {
            let mut payload = fixture("legacy/sample.json");
            payload["_files"][0]["key"] = key.into();
            assert!(
                matches!(parse_payload(&payload), Err(AdapterError::Invalid(msg)) if msg.contains("file key")),
                "{key}"
            );
        }

        let mut workflow = fixture("workflow/sample.json");
        workflow["files"]["pdf"] = "https://s3.example.org/scoap3-files/..".into();
        assert!(matches!(parse_payload(&workflow), Err(AdapterError::Invalid(_))));
    }

    #[test]
    fn missing_title_or_doi_is_a_validation_error() {
        let mut no_title = minimal();
        no_title["titles"] = json!([]);
        assert!(matches!(parse_payload(&no_title), Err(AdapterError::Invalid(msg)) if msg.contains("title")));

        let mut no_doi = minimal();
        no_doi["dois"] = json!([{"value": "  "}]);
        assert!(matches!(parse_payload(&no_doi), Err(AdapterError::Invalid(msg)) if msg.contains("DOI")));
    }

    #[test]
    fn duplicate_dois_collapse_in_order() {
        let mut payload = minimal();
        payload["dois"] = json!([{"value": "10.1/b"}, {"value": "10.1/a"}, {"value": "10.1/b"}]);
        let draft = parse_payload(&payload).unwrap();
        assert_eq!(draft.dois, vec!["10.1/b", "10.1/a"]);
    }

    #[test]
    fn licenses_accept_bare_names_and_skip_empty_entries() {
        let mut payload = minimal();
        payload["license"] = json!(["CC BY 4.0", {"url": "", "license": ""}, {"url": "https://example.org/l"}]);
        let draft = parse_payload(&payload).unwrap();
        assert_eq!(
            draft.licenses,
            vec![
                LicenseDraft { url: None, name: Some("CC BY 4.0".into()) },
                LicenseDraft { url: Some("https://example.org/l".into()), name: None },
            ]
        );
    }

    #[test]
    fn control_number_must_be_a_positive_integer() {
        let mut payload = minimal();
        payload["control_number"] = json!("12a");
        assert!(parse_payload(&payload).is_err());
        payload["control_number"] = json!("77");
        assert_eq!(parse_payload(&payload).unwrap().article_id, Some(77));
    }

    #[test]
    fn non_objects_and_bad_json_are_rejected() {
        assert!(matches!(parse_payload(&json!([1, 2])), Err(AdapterError::UnknownShape)));
        assert!(parse_payload_bytes(b"{not json").is_err());
    }

    #[test]
    fn timestamps_accept_offsets_naive_and_bare_dates() {
        assert!(parse_timestamp("2023-10-06T08:15:00Z").is_some());
        assert!(parse_timestamp("2023-10-06T08:15:00.123456").is_some());
        assert_eq!(
            parse_timestamp("2023-10-06").map(|t| t.to_rfc3339()),
            Some("2023-10-06T00:00:00+00:00".to_string())
        );
        assert_eq!(file_name_from_url("https://x.org/a/b/main.xml?sig=1"), "main.xml");
    }
}
