//! Compliance evaluation: seven independent rules over a loaded article, aggregated into one stored report.

pub mod checks;
pub mod doi;
pub mod engine;
pub mod rules;
pub mod scan;

pub use doi::{CrossrefRegistry, DoiLookupError, DoiRegistry, CROSSREF_API_BASE};
pub use engine::{BulkEvaluation, ComplianceEngine, ComplianceError};
pub use rules::{CompliancePolicy, RULES_FILE};
pub use scan::{FileTextScanner, FsTextScanner, ScanError};

pub const CRATE_NAME: &str = "scoap-compliance";
