//! Pipeline step definitions.
//!
//! The default pipeline is the TDD sequence: detect → requirements →
//! planning → test_writing → coding → security → review. Checkpoint-enabled
//! steps pause for a human decision after the agent finishes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// Populates context fields from the detection collaborator. No checkpoint.
    Detection,
    /// Invokes an external agent with bounded retries.
    Agent,
}

/// Definition of a single pipeline step.
#[derive(Debug, Clone, Copy)]
pub struct PipelineStep {
    pub name: &'static str,
    pub step_type: StepType,
    pub agent_name: Option<&'static str>,
    pub checkpoint_after: bool,
    pub description: &'static str,
}

const DEFAULT_PIPELINE: &[PipelineStep] = &[
    PipelineStep {
        name: "detect",
        step_type: StepType::Detection,
        agent_name: None,
        checkpoint_after: false,
        description: "Auto-detect project language, framework, and test runner",
    },
    PipelineStep {
        name: "requirements",
        step_type: StepType::Agent,
        agent_name: Some("requirements"),
        checkpoint_after: true,
        description: "Clarify and structure requirements",
    },
    PipelineStep {
        name: "planning",
        step_type: StepType::Agent,
        agent_name: Some("planning"),
        checkpoint_after: false,
        description: "Explore the codebase and design an implementation approach",
    },
    PipelineStep {
        name: "test_writing",
        step_type: StepType::Agent,
        agent_name: Some("test_writer"),
        checkpoint_after: true,
        description: "Write tests (TDD red phase)",
    },
    PipelineStep {
        name: "coding",
        step_type: StepType::Agent,
        agent_name: Some("coder"),
        checkpoint_after: false,
        description: "Implement code until tests pass (TDD green phase)",
    },
    PipelineStep {
        name: "security",
        step_type: StepType::Agent,
        agent_name: Some("security"),
        checkpoint_after: true,
        description: "Detect and patch security vulnerabilities",
    },
    PipelineStep {
        name: "review",
        step_type: StepType::Agent,
        agent_name: Some("reviewer"),
        checkpoint_after: true,
        description: "Review code quality and best practices",
    },
];

/// The ordered steps every run executes.
pub fn default_pipeline() -> &'static [PipelineStep] {
    DEFAULT_PIPELINE
}

/// Position of a step by name, used to slice the pipeline on resume.
pub fn step_index(name: &str) -> Option<usize> {
    DEFAULT_PIPELINE.iter().position(|s| s.name == name)
}

/// All step names in declared order.
pub fn step_names() -> Vec<&'static str> {
    DEFAULT_PIPELINE.iter().map(|s| s.name).collect()
}
