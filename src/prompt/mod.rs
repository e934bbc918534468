pub mod examples;

use crate::config::PromptConfig;
use minijinja::{Environment, context};
use thiserror::Error;
use tracing::{debug, warn};

pub use examples::{FewShotExample, load_examples};

const SQL_PROMPT: &str = include_str!("../../templates/sql_prompt.j2");
const INTENT_PROMPT: &str = include_str!("../../templates/intent_prompt.j2");
const INSIGHTS_PROMPT: &str = include_str!("../../templates/insights_prompt.j2");
const CHART_PROMPT: &str = include_str!("../../templates/chart_prompt.j2");

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("could not load few-shot examples from {path}: {reason}")]
    Examples { path: String, reason: String },
}

/// Template environment with every prompt the service renders.
pub fn environment() -> Result<Environment<'static>, PromptError> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.add_template("sql_prompt", SQL_PROMPT)?;
    env.add_template("intent_prompt", INTENT_PROMPT)?;
    env.add_template("insights_prompt", INSIGHTS_PROMPT)?;
    env.add_template("chart_prompt", CHART_PROMPT)?;
    Ok(env)
}

pub struct PromptAssembler {
    env: Environment<'static>,
    config: PromptConfig,
    forbidden: Vec<String>,
}

impl PromptAssembler {
    pub fn new(config: PromptConfig, forbidden: Vec<String>) -> Result<Self, PromptError> {
        Ok(Self {
            env: environment()?,
            config,
            forbidden: forbidden.iter().map(|k| k.to_uppercase()).collect(),
        })
    }

    /// Builds the generation prompt from the rendered schema context. The
    /// context is cut at a line boundary to `max_context_chars`; if the
    /// prompt is still over `max_prompt_chars`, trailing examples are
    /// dropped until it fits.
    pub fn build_prompt(
        &self,
        question: &str,
        schema_context: &str,
        examples: &[FewShotExample],
    ) -> Result<String, PromptError> {
        let schema_context = truncate_at_line(schema_context, self.config.max_context_chars);

        let mut count = examples.len().min(self.config.max_examples);
        loop {
            let prompt = self.render(question, &schema_context, &examples[..count])?;
            if prompt.len() <= self.config.max_prompt_chars || count == 0 {
                if prompt.len() > self.config.max_prompt_chars {
                    warn!(
                        "Prompt is {} chars with no examples left, limit is {}",
                        prompt.len(),
                        self.config.max_prompt_chars
                    );
                }
                debug!("Prompt assembled with {} examples, {} chars", count, prompt.len());
                return Ok(prompt);
            }
            count -= 1;
        }
    }

    fn render(
        &self,
        question: &str,
        schema_context: &str,
        examples: &[FewShotExample],
    ) -> Result<String, PromptError> {
        let template = self.env.get_template("sql_prompt")?;
        Ok(template.render(context! {
            question => question,
            schema_context => schema_context,
            examples => examples,
            forbidden => &self.forbidden,
        })?)
    }
}

fn truncate_at_line(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }

    let marker = "... (schema context truncated)\n";
    let budget = max_chars.saturating_sub(marker.len());
    let mut out = String::new();
    for line in text.lines() {
        if out.len() + line.len() + 1 > budget {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(marker);
    out
}
