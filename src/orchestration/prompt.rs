//! Prompt assembly for task attempts.
//!
//! The engine only needs `{system_prompt, prompt}` strings; how they are
//! worded belongs to a [`PromptBuilder`]. [`TemplatePromptBuilder`] is the
//! built-in one, with a system prompt per worker role.

use crate::core::task::{Task, Worker};
use crate::plan::{Rule, RuleTrigger, Skill, SkillCategory};

/// Context carried into every attempt after the first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryContext {
    /// 1-based number of the attempt being prepared.
    pub attempt: u32,
    /// Summary reported by the previous failed attempt.
    pub failure_summary: String,
    /// Uncommitted workspace changes, when version control can supply them.
    pub diff: Option<String>,
    /// Output of the most recent test run, when one was written.
    pub test_output: Option<String>,
}

impl RetryContext {
    /// Markdown block appended to the prompt. Optional sections are omitted
    /// when absent.
    pub fn render(&self) -> String {
        let mut parts = vec![
            format!("## Retry Context (attempt {})", self.attempt),
            "The previous attempt did not succeed.".to_string(),
            format!("\n### Previous Failure\n{}", self.failure_summary),
        ];
        if let Some(diff) = self.diff.as_deref().filter(|d| !d.trim().is_empty()) {
            parts.push(format!(
                "\n### Changes Since Last Commit\n```diff\n{}\n```",
                diff.trim_end()
            ));
        }
        if let Some(output) = self.test_output.as_deref().filter(|o| !o.trim().is_empty()) {
            parts.push(format!("\n### Latest Test Output\n```\n{}\n```", output.trim_end()));
        }
        parts.join("\n")
    }
}

/// Everything a builder may draw on for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub task: &'a Task,
    pub worker: &'a Worker,
    pub goal: &'a str,
    pub skills: &'a [Skill],
    pub rules: &'a [Rule],
    /// Capped summaries of completed transitive predecessors.
    pub predecessors: &'a [String],
    /// Workspace file listing; empty when there is nothing to list.
    pub manifest: &'a str,
    pub retry: Option<&'a RetryContext>,
}

fn skills_in(skills: &[Skill], category: SkillCategory) -> impl Iterator<Item = &Skill> {
    skills.iter().filter(move |s| s.category == category)
}

fn rules_for(rules: &[Rule], trigger: RuleTrigger) -> impl Iterator<Item = &Rule> {
    rules.iter().filter(move |r| r.trigger == trigger)
}

/// Push a `### name` block per item under `heading`, if there are any.
fn push_section<'a>(
    parts: &mut Vec<String>,
    heading: &str,
    items: impl Iterator<Item = (&'a str, &'a str)>,
) {
    let blocks: Vec<String> = items
        .map(|(name, prompt)| format!("### {}\n{}", name, prompt))
        .collect();
    if !blocks.is_empty() {
        parts.push(format!("\n## {}", heading));
        parts.extend(blocks);
    }
}

/// Prompt pair handed to the agent service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system_prompt: String,
    pub prompt: String,
}

/// Prompt-builder seam.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, input: &PromptInput<'_>) -> Prompt;
}

/// Default builder with role-specific system prompts.
#[derive(Debug, Clone, Default)]
pub struct TemplatePromptBuilder;

impl TemplatePromptBuilder {
    fn role_rules(role: &str) -> &'static str {
        match role {
            "tester" => {
                "You are a TESTER. Write tests for the acceptance criteria, run them, and \
                 report PASS or FAIL for each."
            }
            "reviewer" => {
                "You are a REVIEWER. Check the code against the task and its acceptance \
                 criteria. You may make small fixes directly."
            }
            _ => "You are a BUILDER. Write code, create files, and implement the task.",
        }
    }

    fn system_prompt(input: &PromptInput<'_>) -> String {
        let (task, worker) = (input.task, input.worker);
        let persona = if worker.persona.is_empty() {
            "Helpful and focused."
        } else {
            &worker.persona
        };
        let allowed = if worker.allowed_paths.is_empty() {
            "src/, tests/".to_string()
        } else {
            worker.allowed_paths.join(", ")
        };
        let restricted = if worker.restricted_paths.is_empty() {
            ".kiln/".to_string()
        } else {
            worker.restricted_paths.join(", ")
        };
        let mut prompt = format!(
            "You are {name}, a {role} agent.\n\n\
             ## Your Persona\n{persona}\n\n\
             ## Your Role\n{rules}\n\n\
             ## Rules\n\
             - Create files ONLY within your allowed paths: {allowed}\n\
             - Do NOT modify files in restricted paths: {restricted}\n\
             - When you finish, write a 2-3 sentence summary of what you did to \
             .kiln/comms/{task_id}_summary.md\n",
            name = worker.name,
            role = worker.role,
            rules = Self::role_rules(&worker.role),
            task_id = task.id,
        );

        let mut custom: Vec<String> = skills_in(input.skills, SkillCategory::Agent)
            .map(|s| format!("### Skill: {}\n{}", s.name, s.prompt))
            .collect();
        custom.extend(
            rules_for(input.rules, RuleTrigger::Always)
                .map(|r| format!("### Rule: {}\n{}", r.name, r.prompt)),
        );
        if !custom.is_empty() {
            prompt.push_str("\n## Custom Instructions\n");
            prompt.push_str(&custom.join("\n\n"));
            prompt.push('\n');
        }
        prompt
    }
}

impl PromptBuilder for TemplatePromptBuilder {
    fn build(&self, input: &PromptInput<'_>) -> Prompt {
        let task = input.task;
        let mut parts = vec![
            format!("# Task: {}", task.display_name()),
            format!("\n## Description\n{}", task.description),
        ];
        if !task.acceptance_criteria.is_empty() {
            parts.push("\n## Acceptance Criteria".to_string());
            parts.extend(task.acceptance_criteria.iter().map(|c| format!("- {}", c)));
        }
        if !input.goal.is_empty() {
            parts.push(format!("\n## Project Context\nGoal: {}", input.goal));
        }
        push_section(
            &mut parts,
            "Detailed Feature Instructions",
            skills_in(input.skills, SkillCategory::Feature)
                .map(|s| (s.name.as_str(), s.prompt.as_str())),
        );
        push_section(
            &mut parts,
            "Detailed Style Instructions",
            skills_in(input.skills, SkillCategory::Style)
                .map(|s| (s.name.as_str(), s.prompt.as_str())),
        );
        push_section(
            &mut parts,
            "Validation Rules",
            rules_for(input.rules, RuleTrigger::OnTaskComplete)
                .map(|r| (r.name.as_str(), r.prompt.as_str())),
        );
        if !input.predecessors.is_empty() {
            parts.push("\n## What Happened Before You".to_string());
            parts.push("Previous agents completed these tasks:".to_string());
            for summary in input.predecessors {
                parts.push(format!("\n---\n{}", summary));
            }
        }
        if !input.manifest.trim().is_empty() {
            parts.push(format!("\n## FILES IN WORKSPACE\n{}", input.manifest.trim_end()));
        }
        if let Some(retry) = input.retry {
            parts.push(format!("\n{}", retry.render()));
            push_section(
                &mut parts,
                "Retry Rules",
                rules_for(input.rules, RuleTrigger::OnTestFail)
                    .map(|r| (r.name.as_str(), r.prompt.as_str())),
            );
        }

        Prompt {
            system_prompt: Self::system_prompt(input),
            prompt: parts.join("\n"),
        }
    }
}
