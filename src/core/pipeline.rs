//! Pipeline specification parsing.
//!
//! The spec file lives at a fixed path inside the checkout:
//!
//! ```yaml
//! runtimes: [nodejs18]
//! steps:
//!   - id: install
//!     run: npm ci
//!   - id: deploy
//!     label: Deploy to production
//!     run: npm run deploy
//!     needs: [install]
//!     env:
//!       NODE_ENV: production
//! ```
//!
//! Steps are ordered by `needs` (declaration order breaks ties). Any problem
//! with the file is fatal to the run.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub run: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl PipelineStep {
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PipelineSpec {
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
    #[serde(default)]
    pub runtimes: Vec<String>,
}

/// Read and validate the spec at `path`; steps come back in execution order.
pub fn parse_spec(path: &Path) -> Result<PipelineSpec> {
    let display = path.display().to_string();
    if !path.is_file() {
        return Err(Error::pipeline_invalid(&display, "pipeline file not found"));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::pipeline_invalid(&display, e.to_string()))?;
    parse_spec_str(&content, &display)
}

pub fn parse_spec_str(content: &str, source: &str) -> Result<PipelineSpec> {
    let mut spec: PipelineSpec = serde_yml::from_str(content)
        .map_err(|e| Error::pipeline_invalid(source, e.to_string()))?;

    if spec.steps.is_empty() {
        return Err(Error::pipeline_invalid(source, "pipeline declares no steps"));
    }

    if let Some(step) = spec.steps.iter().find(|s| s.id.trim().is_empty()) {
        return Err(Error::pipeline_invalid(
            source,
            format!("step running '{}' has an empty id", step.run),
        ));
    }

    if let Some(step) = spec.steps.iter().find(|s| s.run.trim().is_empty()) {
        return Err(Error::pipeline_invalid(
            source,
            format!("step '{}' has an empty run command", step.id),
        ));
    }

    spec.steps = order_steps(&spec.steps).map_err(|problem| Error::pipeline_invalid(source, problem))?;
    spec.runtimes.retain(|r| !r.trim().is_empty());
    spec.runtimes.dedup();

    Ok(spec)
}

fn order_steps(steps: &[PipelineStep]) -> std::result::Result<Vec<PipelineStep>, String> {
    if steps.len() <= 1 {
        return Ok(steps.to_vec());
    }

    let mut id_index = HashMap::new();
    for (idx, step) in steps.iter().enumerate() {
        if id_index.insert(step.id.as_str(), idx).is_some() {
            return Err(format!("duplicate step id '{}'", step.id));
        }
    }

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

    for (idx, step) in steps.iter().enumerate() {
        for need in &step.needs {
            let Some(&parent_idx) = id_index.get(need.as_str()) else {
                return Err(format!("step '{}' depends on unknown step '{}'", step.id, need));
            };
            indegree[idx] += 1;
            dependents[parent_idx].push(idx);
        }
    }

    let mut queue: VecDeque<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(idx, _)| idx)
        .collect();

    let mut ordered = Vec::with_capacity(steps.len());
    while let Some(idx) = queue.pop_front() {
        ordered.push(steps[idx].clone());
        for &child in &dependents[idx] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    if ordered.len() != steps.len() {
        let pending: Vec<&str> = steps
            .iter()
            .enumerate()
            .filter(|(idx, _)| indegree[*idx] > 0)
            .map(|(_, step)| step.id.as_str())
            .collect();
        return Err(format!("steps contain a cycle: {}", pending.join(", ")));
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn ids(spec: &PipelineSpec) -> Vec<&str> {
        spec.steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn parses_steps_and_runtimes() {
        let spec = parse_spec_str(
            "runtimes: [nodejs18, python3.9]\nsteps:\n  - id: install\n    run: npm ci\n  - id: test\n    run: npm test\n    env:\n      CI: 'true'\n",
            "inline",
        )
        .unwrap();
        assert_eq!(ids(&spec), vec!["install", "test"]);
        assert_eq!(spec.runtimes, vec!["nodejs18", "python3.9"]);
        assert_eq!(spec.steps[1].env["CI"], "true");
    }

    #[test]
    fn needs_reorder_steps() {
        let spec = parse_spec_str(
            "steps:\n  - id: deploy\n    run: ./deploy\n    needs: [build]\n  - id: build\n    run: make\n",
            "inline",
        )
        .unwrap();
        assert_eq!(ids(&spec), vec!["build", "deploy"]);
    }

    #[test]
    fn independent_steps_keep_declaration_order() {
        let spec = parse_spec_str(
            "steps:\n  - id: c\n    run: c\n  - id: a\n    run: a\n  - id: b\n    run: b\n",
            "inline",
        )
        .unwrap();
        assert_eq!(ids(&spec), vec!["c", "a", "b"]);
    }

    #[test]
    fn cycles_are_fatal() {
        let err = parse_spec_str(
            "steps:\n  - id: a\n    run: a\n    needs: [b]\n  - id: b\n    run: b\n    needs: [a]\n",
            "inline",
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::RunPipelineInvalid);
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn unknown_need_is_fatal() {
        let err = parse_spec_str("steps:\n  - id: a\n    run: a\n    needs: [zzz]\n", "inline").unwrap_err();
        assert!(err.message.contains("unknown step 'zzz'"));
    }

    #[test]
    fn duplicate_ids_are_fatal() {
        let err = parse_spec_str("steps:\n  - id: a\n    run: a\n  - id: a\n    run: b\n", "inline").unwrap_err();
        assert!(err.message.contains("duplicate step id"));
    }

    #[test]
    fn empty_or_malformed_specs_are_fatal() {
        assert!(parse_spec_str("steps: []\n", "inline").is_err());
        assert!(parse_spec_str("steps: [[[", "inline").is_err());
        assert!(parse_spec_str("steps:\n  - id: a\n    run: ''\n", "inline").is_err());
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_spec(&dir.path().join("cd-pipeline.yaml")).unwrap_err();
        assert_eq!(err.code, ErrorCode::RunPipelineInvalid);
    }
}
