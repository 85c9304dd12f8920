//! Prompt rendering from embedded minijinja templates.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::directive::BUILTIN_FUNCTIONS;
use crate::core::environment::EnvironmentContext;
use crate::core::types::CodeKind;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const FUNCTIONS_TEMPLATE: &str = include_str!("prompts/functions.md");
const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const STEP_OUTPUT_TEMPLATE: &str = include_str!("prompts/step_output.md");
const FUNCTION_RESULTS_TEMPLATE: &str = include_str!("prompts/function_results.md");
const WAIT_COMPLETE_TEMPLATE: &str = include_str!("prompts/wait_complete.md");
const UNRECOGNIZED_TEMPLATE: &str = include_str!("prompts/unrecognized.md");
const REJECTED_TEMPLATE: &str = include_str!("prompts/rejected.md");
const SELF_UPDATE_REJECTED_TEMPLATE: &str = include_str!("prompts/self_update_rejected.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        let templates = [
            ("system", SYSTEM_TEMPLATE),
            ("functions", FUNCTIONS_TEMPLATE),
            ("initial", INITIAL_TEMPLATE),
            ("step_output", STEP_OUTPUT_TEMPLATE),
            ("function_results", FUNCTION_RESULTS_TEMPLATE),
            ("wait_complete", WAIT_COMPLETE_TEMPLATE),
            ("unrecognized", UNRECOGNIZED_TEMPLATE),
            ("rejected", REJECTED_TEMPLATE),
            ("self_update_rejected", SELF_UPDATE_REJECTED_TEMPLATE),
        ];
        for (name, source) in templates {
            env.add_template(name, source)
                .with_context(|| format!("load template {name}"))?;
        }
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let rendered = self
            .env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .with_context(|| format!("render template {name}"))?;
        debug!(template = name, bytes = rendered.len(), "prompt rendered");
        Ok(rendered)
    }

    pub fn system(&self) -> Result<String> {
        self.render("system", context! {})
    }

    /// First prompt of a task: goal, environment facts and standing instructions.
    pub fn initial(&self, goal: &str, env: &EnvironmentContext) -> Result<String> {
        self.render(
            "initial",
            context! {
                goal => goal.trim(),
                env => env,
                available => env.available_commands(),
                unavailable => env.unavailable_commands(),
                functions => BUILTIN_FUNCTIONS,
            },
        )
    }

    pub fn step_output(
        &self,
        goal: &str,
        step: u32,
        kind: CodeKind,
        output: &str,
        env: &EnvironmentContext,
    ) -> Result<String> {
        self.render(
            "step_output",
            context! {
                goal => goal.trim(),
                step => step,
                marker => kind.marker(),
                output => output,
                environment => env.summary(),
                functions => BUILTIN_FUNCTIONS,
            },
        )
    }

    pub fn function_results(&self, goal: &str, results: &[String]) -> Result<String> {
        self.render(
            "function_results",
            context! {
                goal => goal.trim(),
                results => results,
                functions => BUILTIN_FUNCTIONS,
            },
        )
    }

    pub fn wait_complete(&self, goal: &str, seconds: u64, results: &[String]) -> Result<String> {
        self.render(
            "wait_complete",
            context! {
                goal => goal.trim(),
                seconds => seconds,
                results => results,
                functions => BUILTIN_FUNCTIONS,
            },
        )
    }

    pub fn unrecognized(&self, goal: &str) -> Result<String> {
        self.render(
            "unrecognized",
            context! { goal => goal.trim(), functions => BUILTIN_FUNCTIONS },
        )
    }

    pub fn rejected(&self, goal: &str, reason: &str) -> Result<String> {
        self.render(
            "rejected",
            context! { goal => goal.trim(), reason => reason, functions => BUILTIN_FUNCTIONS },
        )
    }

    pub fn self_update_rejected(&self, goal: &str, reason: &str) -> Result<String> {
        self.render(
            "self_update_rejected",
            context! { goal => goal.trim(), reason => reason },
        )
    }
}
