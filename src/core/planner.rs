//! Planner: turns a research goal into a validated [`Plan`].
//!
//! The model is asked for a JSON array of steps in the same shape plans use
//! on disk. Anything that does not parse or validate is a
//! [`PlanningError`]; there is no fallback plan.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::plan::{Plan, PlanStep, PlanningError};
use crate::adapters::{CompletionOptions, InferenceClient};

const PLANNER_INSTRUCTIONS: &str = r#"You are the planner of a research pipeline. Decompose the user's goal into an ordered list of steps.
Output ONLY a JSON array. Each element is one step object:
- "intent": short description of what the step achieves
- "kind": one of "tools", "analysis", "synthesis"
- "depends_on": array of 1-based positions of EARLIER steps whose outputs this step uses
For "tools" steps add "calls": an array of calls, each with a unique "id" and a "tool" plus its arguments:
  {"id": "...", "tool": "arxiv_search", "query": "...", "max_results": 5}
  {"id": "...", "tool": "pubchem_query", "keywords": ["..."], "compound_type": "..."}
  {"id": "...", "tool": "web_fetch", "url": "https://..."}
  {"id": "...", "tool": "publish_report", "title": "..."}
Several calls in one step run in parallel.
A publish_report call without "body" publishes the final report of the synthesis step it depends on.
For "analysis" steps add "script": {"source": "<python that reads files from $COSCI_INPUTS_DIR and prints one JSON object with summary, metrics, tables>"}.
For "synthesis" steps add "instruction": what to write from the upstream results.
For the final report add "format": "structured"; it returns hypothesis, protocol summary, analysis findings, prior-art links and next steps.
Output ONLY the JSON array, no markdown, no explanation."#;

/// Generates plans with the inference endpoint
pub struct Planner {
    llm: Arc<dyn InferenceClient>,
    options: CompletionOptions,
}

impl Planner {
    pub fn new(llm: Arc<dyn InferenceClient>) -> Self {
        Self {
            llm,
            options: CompletionOptions {
                system: Some(PLANNER_INSTRUCTIONS.to_string()),
                ..Default::default()
            },
        }
    }

    /// Override completion options (the planner instructions are kept)
    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        let system = self.options.system.take();
        self.options = CompletionOptions { system, ..options };
        self
    }

    /// Decompose a goal into a plan
    #[instrument(skip(self))]
    pub async fn create_plan(&self, goal: &str) -> Result<Plan, PlanningError> {
        if goal.trim().is_empty() {
            return Err(PlanningError::EmptyGoal);
        }

        let prompt = format!("Research goal: {}", goal.trim());
        let response = self.llm.complete(&prompt, &self.options).await?;
        debug!(response_bytes = response.len(), "Planner response received");

        let steps = parse_steps(&response)?;
        if steps.is_empty() {
            warn!("Planner returned no steps");
            return Err(PlanningError::NoActionableSteps);
        }

        let plan = Plan::new(goal.trim(), steps)?;
        info!(plan_id = %plan.id, steps = plan.len(), "Plan created");
        Ok(plan)
    }
}

/// Parse model output into plan steps, tolerating prose or code fences
pub fn parse_steps(content: &str) -> Result<Vec<PlanStep>, PlanningError> {
    let trimmed = content.trim();

    let json_str = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(PlanningError::Malformed(
                "no JSON array in planner output".to_string(),
            ))
        }
    };

    serde_json::from_str(json_str).map_err(|e| PlanningError::Malformed(e.to_string()))
}
