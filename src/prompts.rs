//! Prompt templates for the advisor chat and the parameter extraction request.
//!
//! Templates are minijinja sources. Both receive `fields`, a list of
//! `{name, description}` entries for the six pricing factors.

use minijinja::{context, Environment};
use serde::Serialize;

use crate::error::Result;
use crate::pricing::PricingField;

pub const ADVISOR_TEMPLATE: &str = "\
You are an expert pricing assistant for handmade goods. Your goal is to help artisans \
determine the best parameters for pricing their handcrafted items. Ask targeted questions \
to gather information about:
{% for field in fields %}
{{ loop.index }}. {{ field.description }}
{%- endfor %}

Be conversational but focused on gathering the information above. Ask about one or two \
factors at a time, and confirm numbers back to the artisan when they are ambiguous.";

pub const EXTRACTION_TEMPLATE: &str = "\
You are a pricing expert for handmade goods. Read the conversation you are given and \
report the pricing parameters the artisan has stated or clearly implied.

Respond with a single JSON object with exactly these keys:
{%- for field in fields %}
- {{ field.name }}: {{ field.description }} (number or null)
{%- endfor %}
- explanation: one or two sentences on how you chose the values (string)

Use null for any parameter the conversation does not establish. Do not guess or fill in \
defaults. When the artisan revises a value, report the latest one.";

/// Prefix of the user turn that carries the transcript in an extraction request.
pub const EXTRACTION_REQUEST_PREFIX: &str =
    "Based on this conversation, report the pricing parameters:\n\n";

#[derive(Serialize)]
struct FieldDoc {
    name: &'static str,
    description: &'static str,
}

fn field_docs() -> Vec<FieldDoc> {
    PricingField::ALL
        .iter()
        .map(|f| FieldDoc {
            name: f.as_str(),
            description: f.description(),
        })
        .collect()
}

fn render(template: &str) -> Result<String> {
    let env = Environment::new();
    Ok(env.render_str(template, context! { fields => field_docs() })?)
}

pub fn render_advisor(template: &str) -> Result<String> {
    render(template)
}

pub fn render_extraction(template: &str) -> Result<String> {
    render(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisor_prompt_lists_every_factor() {
        let prompt = render_advisor(ADVISOR_TEMPLATE).unwrap();
        for field in PricingField::ALL {
            assert!(prompt.contains(field.description()), "missing {field}");
        }
        assert!(prompt.contains("1. Total cost of materials"));
        assert!(prompt.contains("6. Target profit margin"));
    }

    #[test]
    fn test_extraction_prompt_names_json_keys() {
        let prompt = render_extraction(EXTRACTION_TEMPLATE).unwrap();
        for field in PricingField::ALL {
            assert!(prompt.contains(&format!("- {}:", field.as_str())));
        }
        assert!(prompt.contains("null"));
        assert!(prompt.contains("- explanation:"));
    }

    #[test]
    fn test_custom_template_renders() {
        let prompt = render_advisor("Ask about {{ fields | length }} things.").unwrap();
        assert_eq!(prompt, "Ask about 6 things.");
    }

    #[test]
    fn test_syntax_error_is_reported() {
        assert!(render_advisor("{% for %}").is_err());
    }
}
