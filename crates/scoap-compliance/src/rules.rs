use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const RULES_FILE: &str = "rules/compliance.yaml";

/// Tunable inputs of the seven compliance rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompliancePolicy {
    pub compliant_licenses: Vec<String>,
    pub default_file_formats: Vec<String>,
    pub journal_file_formats: BTreeMap<String, Vec<String>>,
    pub banned_article_types: Vec<String>,
    pub partial_journals: Vec<String>,
    pub arxiv_category_prefix: String,
    pub funding_phrase: String,
    pub max_doi_registration_days: i64,
}

impl Default for CompliancePolicy {
    fn default() -> Self {
        Self {
            compliant_licenses: strings(&["CC-BY-4.0", "CC-BY-3.0"]),
            default_file_formats: strings(&["pdf", "pdf/a", "xml"]),
            journal_file_formats: BTreeMap::new(),
            banned_article_types: strings(&["Erratum", "Addendum", "Corrigendum", "Editorial", "Obituaries"]),
            partial_journals: strings(&["CPC", "PTEP", "AHEP", "PRC", "PRL", "APPB"]),
            arxiv_category_prefix: "hep".to_string(),
            funding_phrase: "Funded by SCOAP3".to_string(),
            max_doi_registration_days: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(flatten)]
    policy: CompliancePolicy,
}

impl CompliancePolicy {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(raw).context("parsing compliance policy")?;
        Ok(file.policy)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        Self::from_path(&root.join(RULES_FILE))
    }

    /// Falls back to the built-in policy when no rules file exists at `path`.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_path(path)
        } else {
            warn!(path = %path.display(), "compliance rules file missing; using built-in policy");
            Ok(Self::default())
        }
    }

    pub fn required_formats_for(&self, journal_title: &str) -> &[String] {
        self.journal_file_formats
            .get(journal_title)
            .map(Vec::as_slice)
            .unwrap_or(self.default_file_formats.as_slice())
    }

    pub fn is_partial_journal(&self, journal_title: &str) -> bool {
        self.partial_journals.iter().any(|j| j == journal_title)
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_keys() {
        let policy = CompliancePolicy::from_yaml_str(
            "version: 1\njournal_file_formats:\n  Chinese Physics C: [pdf]\n",
        )
        .unwrap();
        assert_eq!(policy.required_formats_for("Chinese Physics C"), ["pdf".to_string()]);
        assert_eq!(policy.required_formats_for("Nuclear Physics B").len(), 3);
        assert_eq!(policy.funding_phrase, "Funded by SCOAP3");
        assert!(policy.is_partial_journal("PTEP"));
        assert!(!policy.is_partial_journal("ptep"));
    }

    #[test]
    fn workspace_rules_file_parses() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let policy = CompliancePolicy::from_workspace_root(&root).unwrap();
        assert_eq!(policy.compliant_licenses, ["CC-BY-4.0", "CC-BY-3.0"]);
        assert_eq!(policy.max_doi_registration_days, 1);
        assert!(policy.is_partial_journal("Adv. High Energy Phys."));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CompliancePolicy::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(policy, CompliancePolicy::default());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(CompliancePolicy::from_yaml_str("version: [").is_err());
    }
}
