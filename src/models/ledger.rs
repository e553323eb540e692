use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ResultSet, StageType};

/// One cross-stage decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionLedgerEntry {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub reason: String,
    /// Set when a stage deliberately overrides a key declared upstream
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub supersedes: bool,
}

/// A decision as declared by a specific stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub stage_type: StageType,
    pub entry: DecisionLedgerEntry,
}

/// Deduplicated decision record, derived from the live stage results.
///
/// Never mutated directly: rebuild it with [`DecisionLedger::fold`] whenever
/// the result set changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecisionLedger {
    pub entries: Vec<DecisionLedgerEntry>,
}

impl DecisionLedger {
    /// Fold the decisions of all completed results, in completion order.
    ///
    /// A key declared more than once keeps the entry from the most recently
    /// completed stage.
    pub fn fold(results: &ResultSet) -> Self {
        let mut entries: Vec<DecisionLedgerEntry> = Vec::new();
        for declaration in declarations(results) {
            entries.retain(|e| e.key != declaration.entry.key);
            entries.push(declaration.entry);
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&DecisionLedgerEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Every decision declared by completed results, in completion order
pub fn declarations(results: &ResultSet) -> Vec<Declaration> {
    results
        .completed()
        .flat_map(|result| {
            let stage_type = result.stage_type.clone();
            result
                .output
                .as_ref()
                .map(extract_decisions)
                .unwrap_or_default()
                .into_iter()
                .map(move |entry| Declaration {
                    stage_type: stage_type.clone(),
                    entry,
                })
        })
        .collect()
}

/// Read the `decisions` array of a stage output.
///
/// Entries without a string key are skipped; non-string values are kept in
/// their JSON form.
pub fn extract_decisions(output: &Value) -> Vec<DecisionLedgerEntry> {
    let Some(items) = output.get("decisions").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let key = item.get("key")?.as_str()?.trim();
            if key.is_empty() {
                return None;
            }
            let value = match item.get("value") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let reason = item
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let supersedes = item
                .get("supersedes")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Some(DecisionLedgerEntry {
                key: key.to_string(),
                value,
                reason,
                supersedes,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StageResult, StageStatus};
    use serde_json::json;

    fn completed(stage: &str, output: Value) -> StageResult {
        let mut result = StageResult::processing("p1", stage);
        result.status = StageStatus::Completed;
        result.output = Some(output);
        result
    }

    #[test]
    fn test_fold_last_completed_wins() {
        let mut results = ResultSet::new();
        results.replace(completed(
            "a",
            json!({"decisions": [{"key": "auth", "value": "x", "reason": "first"}]}),
        ));
        results.replace(completed(
            "b",
            json!({"decisions": [{"key": "auth", "value": "y", "reason": "second"}]}),
        ));

        let ledger = DecisionLedger::fold(&results);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("auth").unwrap().value, "y");
    }

    #[test]
    fn test_fold_follows_completion_not_declaration_order() {
        let mut results = ResultSet::new();
        results.replace(completed("a", json!({"decisions": [{"key": "db", "value": "pg"}]})));
        results.replace(completed("b", json!({"decisions": [{"key": "db", "value": "mysql"}]})));
        // "a" is re-run and completes after "b"
        results.replace(completed("a", json!({"decisions": [{"key": "db", "value": "sqlite"}]})));

        let ledger = DecisionLedger::fold(&results);
        assert_eq!(ledger.get("db").unwrap().value, "sqlite");
    }

    #[test]
    fn test_extract_decisions_tolerates_noise() {
        let output = json!({"decisions": [
            {"key": "scale", "value": 3},
            {"value": "orphan"},
            {"key": " ", "value": "blank"},
            "not an object"
        ]});
        let decisions = extract_decisions(&output);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].value, "3");
        assert!(extract_decisions(&json!({})).is_empty());
    }
}
