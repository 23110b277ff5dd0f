//! Execution plans: ordered stages of sequential, parallel and decision steps

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, SupervisorError};

/// One sub-agent invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub agent_name: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl AgentStep {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            input: None,
            config: Value::Null,
            timeout_ms: None,
            max_attempts: None,
        }
    }

    /// Override the run input for this step
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPath {
    pub name: String,
    /// Metadata keys that must all be present for this path to be eligible
    #[serde(default)]
    pub requires: Vec<String>,
    pub stages: Vec<PlanStage>,
}

impl DecisionPath {
    pub fn new(name: impl Into<String>, requires: Vec<String>, stages: Vec<PlanStage>) -> Self {
        Self {
            name: name.into(),
            requires,
            stages,
        }
    }

    pub fn step_count(&self) -> u32 {
        self.stages.iter().map(PlanStage::step_count).sum()
    }
}

/// Paths are listed in priority order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub name: String,
    pub paths: Vec<DecisionPath>,
}

impl DecisionPoint {
    pub fn new(name: impl Into<String>, paths: Vec<DecisionPath>) -> Self {
        Self {
            name: name.into(),
            paths,
        }
    }

    /// Pick the eligible path with the most satisfied requirements. Ties go to
    /// the earlier path.
    pub fn choose(&self, metadata: &HashMap<String, Value>) -> Option<&DecisionPath> {
        let mut best: Option<&DecisionPath> = None;
        for path in &self.paths {
            if !path.requires.iter().all(|key| metadata.contains_key(key)) {
                continue;
            }
            if best.map_or(true, |current| path.requires.len() > current.requires.len()) {
                best = Some(path);
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PlanStage {
    Sequential { steps: Vec<AgentStep> },
    Parallel { steps: Vec<AgentStep> },
    Decision { point: DecisionPoint },
}

impl PlanStage {
    pub fn sequential(steps: Vec<AgentStep>) -> Self {
        PlanStage::Sequential { steps }
    }

    pub fn parallel(steps: Vec<AgentStep>) -> Self {
        PlanStage::Parallel { steps }
    }

    pub fn decision(point: DecisionPoint) -> Self {
        PlanStage::Decision { point }
    }

    /// Agent steps known up front. Decision paths are counted once chosen.
    pub fn step_count(&self) -> u32 {
        match self {
            PlanStage::Sequential { steps } | PlanStage::Parallel { steps } => steps.len() as u32,
            PlanStage::Decision { .. } => 0,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            PlanStage::Sequential { steps } => {
                if steps.is_empty() {
                    return Err(SupervisorError::Validation(
                        "sequential stage has no steps".to_string(),
                    ));
                }
            }
            PlanStage::Parallel { steps } => {
                if steps.is_empty() {
                    return Err(SupervisorError::Validation(
                        "parallel stage has no steps".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                for step in steps {
                    if !seen.insert(step.agent_name.as_str()) {
                        return Err(SupervisorError::Validation(format!(
                            "agent '{}' appears twice in one parallel stage",
                            step.agent_name
                        )));
                    }
                }
            }
            PlanStage::Decision { point } => {
                if point.paths.is_empty() {
                    return Err(SupervisorError::Validation(format!(
                        "decision '{}' has no paths",
                        point.name
                    )));
                }
                for path in &point.paths {
                    for stage in &path.stages {
                        stage.validate()?;
                    }
                }
            }
        }

        let blank = match self {
            PlanStage::Sequential { steps } | PlanStage::Parallel { steps } => {
                steps.iter().any(|step| step.agent_name.trim().is_empty())
            }
            PlanStage::Decision { .. } => false,
        };
        if blank {
            return Err(SupervisorError::Validation(
                "agent step without a name".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<PlanStage>,
}

impl ExecutionPlan {
    pub fn new(stages: Vec<PlanStage>) -> Self {
        Self { stages }
    }

    pub fn step_count(&self) -> u32 {
        self.stages.iter().map(PlanStage::step_count).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(SupervisorError::Validation(
                "execution plan has no stages".to_string(),
            ));
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(())
    }

    /// Triage, then data and optimization side by side, then a report whose
    /// depth depends on which analyses produced results.
    pub fn standard() -> Self {
        Self::new(vec![
            PlanStage::sequential(vec![AgentStep::new("triage")]),
            PlanStage::parallel(vec![AgentStep::new("data"), AgentStep::new("optimization")]),
            PlanStage::decision(DecisionPoint::new(
                "report_strategy",
                vec![
                    DecisionPath::new(
                        "full_report",
                        vec!["data_result".to_string(), "optimizations_result".to_string()],
                        vec![PlanStage::sequential(vec![
                            AgentStep::new("actions"),
                            AgentStep::new("reporting"),
                        ])],
                    ),
                    DecisionPath::new(
                        "summary_report",
                        Vec::new(),
                        vec![PlanStage::sequential(vec![AgentStep::new("reporting")])],
                    ),
                ],
            )),
        ])
    }
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self::standard()
    }
}
