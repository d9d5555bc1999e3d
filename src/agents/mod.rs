//! The agent collaborator contract.
//!
//! An agent receives the mutable pipeline context, does its work against
//! the run's working directory, and returns a usage record. Failures are
//! error values carrying a human-readable message — never a silent no-op.
//! What an agent actually produces is its own business; the engine only
//! sequences, retries, and meters them.

pub mod claude;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::{PipelineContext, StepUsage};
use crate::errors::AgentError;
use crate::settings::Settings;

pub use claude::ClaudeAgent;

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Run against the context's effective working path, mutating the
    /// context with whatever this step produces.
    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepUsage, AgentError>;
}

/// Registry of agents keyed by the names the pipeline steps refer to.
#[derive(Default)]
pub struct AgentSet {
    agents: HashMap<String, Box<dyn Agent>>,
}

impl AgentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Box<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Agent> {
        self.agents.get(name).map(Box::as_ref)
    }

    /// The standard TDD agent roster backed by the Claude Code subprocess.
    pub fn claude_defaults(settings: &Settings) -> Self {
        let mut set = Self::new();
        for (name, instruction) in claude::DEFAULT_INSTRUCTIONS {
            set.register(Box::new(ClaudeAgent::new(
                name,
                instruction,
                &settings.llm.claude_executable,
                Some(settings.llm.model.clone()),
            )));
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskInput;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingAgent {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Agent for CountingAgent {
        fn name(&self) -> &str {
            "counter"
        }

        async fn run(&self, _ctx: &mut PipelineContext) -> Result<StepUsage, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StepUsage {
                cost_usd: 0.01,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn agent_set_registers_and_dispatches_by_name() {
        let mut set = AgentSet::new();
        set.register(Box::new(CountingAgent {
            calls: AtomicU32::new(0),
        }));

        assert!(set.get("counter").is_some());
        assert!(set.get("missing").is_none());

        let mut ctx =
            PipelineContext::new(TaskInput::manual("t", ""), PathBuf::from("/tmp/p"));
        let usage = set.get("counter").unwrap().run(&mut ctx).await.unwrap();
        assert!((usage.cost_usd - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn claude_defaults_cover_the_pipeline_roster() {
        let set = AgentSet::claude_defaults(&Settings::default());
        for name in [
            "requirements",
            "planning",
            "test_writer",
            "coder",
            "security",
            "reviewer",
        ] {
            assert!(set.get(name).is_some(), "missing agent {}", name);
        }
    }
}
