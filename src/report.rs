//! Machine-readable summary of one bisection run.

use crate::search::SearchOutcome;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Host,
    Device,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target: Target,
    pub classpath: String,
    pub class_name: String,
    pub outcome: SearchOutcome,
    pub probe_count: usize,
    pub logfile: PathBuf,
}

impl RunReport {
    pub fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write report '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testable::{Method, OptimizationPass};

    #[test]
    fn test_report_json_shape() {
        let report = RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            target: Target::Host,
            classpath: "classes.dex".to_string(),
            class_name: "Test".to_string(),
            outcome: SearchOutcome::FaultyMethodAndPass {
                method: Method::new("void Test.main()"),
                pass: OptimizationPass::new("inliner"),
            },
            probe_count: 17,
            logfile: PathBuf::from("/tmp/bisection_search_x/log"),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["target"], "host");
        assert_eq!(value["outcome"]["kind"], "faulty_method_and_pass");
        assert_eq!(value["outcome"]["method"], "void Test.main()");
        assert_eq!(value["outcome"]["pass"]["name"], "inliner");
        assert_eq!(value["probe_count"], 17);
    }

    #[test]
    fn test_no_bug_outcome_serializes_as_tag_only() {
        let value = serde_json::to_value(SearchOutcome::NoBug).unwrap();
        assert_eq!(value, serde_json::json!({ "kind": "no_bug" }));
    }
}
