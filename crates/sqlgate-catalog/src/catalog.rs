//! Read-only template/snippet catalog loaded from YAML or JSON

use crate::template::{ApprovalStatus, CatalogEntry, Placeholder, Snippet, Template};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON catalog: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template {id} version {version} already exists with different content")]
    VersionConflict { id: String, version: u32 },

    #[error("Invalid catalog entry {id}: {reason}")]
    InvalidEntry { id: String, reason: String },
}

/// Flat on-disk record; `kind` or tags decide whether it becomes a snippet
#[derive(Debug, Clone, Deserialize)]
struct TemplateRecord {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_version")]
    version: u32,
    intent: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    description: Option<String>,
    sql: String,
    #[serde(default)]
    placeholders: Vec<Placeholder>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    examples: Vec<String>,
    #[serde(default)]
    status: ApprovalStatus,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    List(Vec<TemplateRecord>),
    Document { templates: Vec<TemplateRecord> },
}

impl CatalogFile {
    fn into_records(self) -> Vec<TemplateRecord> {
        match self {
            CatalogFile::List(records) => records,
            CatalogFile::Document { templates } => templates,
        }
    }
}

impl TemplateRecord {
    fn is_snippet(&self) -> bool {
        matches!(self.kind.as_deref(), Some("snippet") | Some("fragment"))
            || self
                .tags
                .iter()
                .any(|t| t.eq_ignore_ascii_case("snippet") || t.eq_ignore_ascii_case("fragment"))
    }

    fn into_entry(self) -> Result<CatalogEntry, CatalogError> {
        let is_snippet = self.is_snippet();
        let template = Template {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            version: self.version,
            intent: self.intent,
            description: self.description,
            sql: self.sql,
            placeholders: self.placeholders,
            keywords: self.keywords,
            tags: self.tags,
            examples: self.examples,
            status: self.status,
        };

        let invalid = |reason: String| CatalogError::InvalidEntry {
            id: template.id.clone(),
            reason,
        };

        if template.sql.trim().is_empty() {
            return Err(invalid("empty SQL".to_string()));
        }
        for name in template.referenced_placeholders() {
            if template.placeholder(&name).is_none() {
                return Err(invalid(format!("placeholder '{name}' is not declared")));
            }
        }

        if is_snippet {
            if self.outputs.is_empty() {
                return Err(invalid("snippet declares no outputs".to_string()));
            }
            Ok(CatalogEntry::Snippet(Snippet {
                template,
                inputs: self.inputs,
                outputs: self.outputs,
            }))
        } else {
            Ok(CatalogEntry::Template(template))
        }
    }
}

/// Records accepted and rejected during a load
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedEntry {
    pub id: String,
    pub reason: String,
}

/// Catalog of entries keyed by id, every version kept
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    entries: HashMap<String, BTreeMap<u32, CatalogEntry>>,
    fingerprints: HashMap<(String, u32), String>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(content: &str) -> Result<(Self, LoadReport), CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(content)?;
        Self::from_records(file.into_records())
    }

    pub fn from_json_str(content: &str) -> Result<(Self, LoadReport), CatalogError> {
        let file: CatalogFile = serde_json::from_str(content)?;
        Self::from_records(file.into_records())
    }

    /// Load a `.json` file as JSON, anything else as YAML
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, LoadReport), CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let (catalog, report) = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        info!(
            path = %path.display(),
            loaded = report.loaded,
            skipped = report.skipped.len(),
            "Template catalog loaded"
        );
        Ok((catalog, report))
    }

    fn from_records(records: Vec<TemplateRecord>) -> Result<(Self, LoadReport), CatalogError> {
        let mut catalog = Self::new();
        let mut report = LoadReport::default();

        for record in records {
            let id = record.id.clone();
            match record.into_entry() {
                Ok(entry) => {
                    if catalog.insert(entry)? {
                        report.loaded += 1;
                    }
                }
                Err(CatalogError::InvalidEntry { id, reason }) => {
                    warn!(template_id = %id, reason = %reason, "Skipping catalog entry");
                    report.skipped.push(SkippedEntry { id, reason });
                }
                Err(e) => {
                    report.skipped.push(SkippedEntry {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok((catalog, report))
    }

    /// Insert an entry. Returns false when the identical version was already present.
    pub fn insert(&mut self, entry: CatalogEntry) -> Result<bool, CatalogError> {
        let template = entry.template();
        let key = (template.id.clone(), template.version);
        let fingerprint = template.fingerprint();

        if let Some(existing) = self.fingerprints.get(&key) {
            if *existing == fingerprint {
                debug!(template_id = %key.0, version = key.1, "Duplicate catalog entry ignored");
                return Ok(false);
            }
            return Err(CatalogError::VersionConflict {
                id: key.0,
                version: key.1,
            });
        }

        self.fingerprints.insert(key.clone(), fingerprint);
        self.entries.entry(key.0).or_default().insert(key.1, entry);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fingerprint(&self, id: &str, version: u32) -> Option<&str> {
        self.fingerprints
            .get(&(id.to_string(), version))
            .map(String::as_str)
    }

    /// Latest approved version of `id`
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries
            .get(id)?
            .values()
            .rev()
            .find(|e| e.template().is_approved())
    }

    pub fn get_version(&self, id: &str, version: u32) -> Option<&CatalogEntry> {
        self.entries.get(id)?.get(&version)
    }

    /// Latest approved version of every id, sorted by id
    pub fn approved(&self) -> Vec<&CatalogEntry> {
        let mut ids: Vec<&String> = self.entries.keys().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn snippets_for_intent(&self, intent: &str) -> Vec<&Snippet> {
        self.approved()
            .into_iter()
            .filter_map(CatalogEntry::as_snippet)
            .filter(|s| s.template.intent == intent)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
templates:
  - id: area_reduction_at_timepoint
    name: Area reduction at timepoint
    intent: temporal_proximity_query
    status: approved
    sql: "SELECT * FROM wound_area WHERE weeks = {{weeks}}"
    placeholders:
      - name: weeks
        type: int
    keywords: [area, reduction, weeks]
  - id: baseline_wound_selection
    intent: temporal_proximity_query
    status: approved
    tags: [snippet]
    sql: "SELECT patient_id, wound_id, MIN(assessment_date) AS baseline_date FROM assessment GROUP BY 1, 2"
    outputs: [baseline_date]
  - id: broken
    intent: outcome_analysis
    sql: "SELECT * FROM t WHERE x = {{missing}}"
"#;

    #[test]
    fn test_load_tags_snippets_and_skips_invalid() {
        let (catalog, report) = TemplateCatalog::from_yaml_str(CATALOG).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].id, "broken");

        assert!(!catalog.get("area_reduction_at_timepoint").unwrap().is_snippet());
        assert!(catalog.get("baseline_wound_selection").unwrap().is_snippet());
        assert_eq!(catalog.snippets_for_intent("temporal_proximity_query").len(), 1);
    }

    #[test]
    fn test_snippet_without_outputs_rejected() {
        let yaml = r#"
- id: s
  kind: snippet
  intent: temporal_proximity_query
  status: approved
  sql: "SELECT 1"
"#;
        let (catalog, report) = TemplateCatalog::from_yaml_str(yaml).unwrap();
        assert!(catalog.is_empty());
        assert!(report.skipped[0].reason.contains("outputs"));
    }

    #[test]
    fn test_version_immutability() {
        let yaml = r#"
- id: t
  intent: outcome_analysis
  status: approved
  sql: "SELECT 1"
- id: t
  intent: outcome_analysis
  status: approved
  sql: "SELECT 1"
"#;
        let (catalog, report) = TemplateCatalog::from_yaml_str(yaml).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(catalog.len(), 1);

        let conflicting = r#"
- id: t
  intent: outcome_analysis
  sql: "SELECT 1"
- id: t
  intent: outcome_analysis
  sql: "SELECT 2"
"#;
        let err = TemplateCatalog::from_yaml_str(conflicting).unwrap_err();
        assert!(matches!(err, CatalogError::VersionConflict { version: 1, .. }));
    }

    #[test]
    fn test_latest_approved_version_wins() {
        let json = r#"[
            {"id": "t", "version": 1, "intent": "outcome_analysis", "status": "approved", "sql": "SELECT 1"},
            {"id": "t", "version": 2, "intent": "outcome_analysis", "status": "approved", "sql": "SELECT 2"},
            {"id": "t", "version": 3, "intent": "outcome_analysis", "status": "draft", "sql": "SELECT 3"}
        ]"#;
        let (catalog, _) = TemplateCatalog::from_json_str(json).unwrap();
        assert_eq!(catalog.get("t").unwrap().template().version, 2);
        assert_eq!(catalog.get_version("t", 3).unwrap().template().sql, "SELECT 3");
        assert_eq!(catalog.approved().len(), 1);
    }
}
