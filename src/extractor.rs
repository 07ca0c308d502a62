//! Pulls the six pricing factors out of a free-form conversation.
//!
//! The whole history is re-read on every call; nothing from an earlier
//! extraction is carried over, so a value the artisan revises later in the
//! chat always wins.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::conversation::{transcript, Message, Role};
use crate::error::{Error, Result};
use crate::oracle::{Oracle, ResponseFormat};
use crate::pricing::{PricingField, PricingInputs};
use crate::prompts;
use crate::retry::RetryPolicy;

/// A possibly incomplete set of pricing inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedParameters {
    pub material_cost: Option<f64>,
    pub hours_worked: Option<f64>,
    pub labor_rate: Option<f64>,
    pub uniqueness: Option<f64>,
    pub demand: Option<f64>,
    pub profit_margin: Option<f64>,
    /// The model's reasoning for the values, when it gave one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ExtractedParameters {
    pub fn get(&self, field: PricingField) -> Option<f64> {
        match field {
            PricingField::MaterialCost => self.material_cost,
            PricingField::HoursWorked => self.hours_worked,
            PricingField::LaborRate => self.labor_rate,
            PricingField::Uniqueness => self.uniqueness,
            PricingField::Demand => self.demand,
            PricingField::ProfitMargin => self.profit_margin,
        }
    }

    fn slot(&mut self, field: PricingField) -> &mut Option<f64> {
        match field {
            PricingField::MaterialCost => &mut self.material_cost,
            PricingField::HoursWorked => &mut self.hours_worked,
            PricingField::LaborRate => &mut self.labor_rate,
            PricingField::Uniqueness => &mut self.uniqueness,
            PricingField::Demand => &mut self.demand,
            PricingField::ProfitMargin => &mut self.profit_margin,
        }
    }

    pub fn present(&self) -> Vec<PricingField> {
        PricingField::ALL
            .into_iter()
            .filter(|f| self.get(*f).is_some())
            .collect()
    }

    pub fn missing(&self) -> Vec<PricingField> {
        PricingField::ALL
            .into_iter()
            .filter(|f| self.get(*f).is_none())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// All six values, or `None` if any is still unknown. Never fills in defaults.
    pub fn to_inputs(&self) -> Option<PricingInputs> {
        Some(PricingInputs {
            material_cost: self.material_cost?,
            hours_worked: self.hours_worked?,
            labor_rate: self.labor_rate?,
            uniqueness: self.uniqueness?,
            demand: self.demand?,
            profit_margin: self.profit_margin?,
        })
    }
}

/// Parses the model's JSON reply. Missing keys and nulls become absent fields.
///
/// A value that cannot be read as a number is also treated as absent and
/// logged, so one odd field does not discard the others. Only a reply that
/// is not a JSON object at all is rejected.
pub fn parse_reply(reply: &str) -> Result<ExtractedParameters> {
    let json = strip_code_fence(reply);
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::MalformedResponse(format!("reply is not JSON ({}): {}", e, reply)))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::MalformedResponse(format!("expected a JSON object, got: {}", reply)))?;

    let mut params = ExtractedParameters::default();
    for field in PricingField::ALL {
        let reading = match read_number(object, field) {
            Ok(reading) => reading,
            Err(reason) => {
                warn!(field = field.as_str(), %reason, "Ignoring unreadable extracted value");
                None
            }
        };
        *params.slot(field) = reading.map(|r| normalize(field, r));
    }
    params.explanation = object
        .get("explanation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(params)
}

/// A number as the model wrote it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    value: f64,
    /// The value was a string ending in `%`.
    percent: bool,
}

fn normalize(field: PricingField, reading: Reading) -> f64 {
    let Reading { value, percent } = reading;
    match field {
        // Ratings are only meaningful to one decimal.
        PricingField::Uniqueness | PricingField::Demand => round_one_decimal(value),
        PricingField::ProfitMargin if percent => value / 100.0,
        // Models often answer a bare 30 for a 30% margin.
        PricingField::ProfitMargin if value > 1.0 && value <= 100.0 => value / 100.0,
        _ => value,
    }
}

fn read_number(
    object: &Map<String, Value>,
    field: PricingField,
) -> std::result::Result<Option<Reading>, String> {
    match object.get(field.as_str()) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(value) => Ok(Some(Reading {
                value,
                percent: false,
            })),
            None => Err(format!("{} is not a usable number", n)),
        },
        Some(Value::String(s)) => {
            let text = s.trim();
            let (text, percent) = match text.strip_suffix('%') {
                Some(rest) => (rest, true),
                None => (text, false),
            };
            let cleaned: String = text
                .trim()
                .trim_start_matches('$')
                .chars()
                .filter(|c| *c != ',')
                .collect();
            let cleaned = cleaned.trim();
            if cleaned.is_empty() {
                return Ok(None);
            }
            match cleaned.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(Some(Reading { value, percent })),
                _ => Err(format!("not a number: {:?}", s)),
            }
        }
        Some(other) => Err(format!("unexpected type: {}", other)),
    }
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    match rest.split_once('\n') {
        // An opening line holding only a language tag is dropped.
        Some((tag, body)) if !tag.trim_start().starts_with(['{', '[']) => body.trim(),
        // One-line fence: skip a tag glued to the JSON, as in ```json{...}```.
        _ => rest
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .trim(),
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub struct ParameterExtractor {
    oracle: Arc<dyn Oracle>,
    retry: RetryPolicy,
    instruction: String,
}

impl ParameterExtractor {
    pub fn new(oracle: Arc<dyn Oracle>, settings: &Settings) -> Result<Self> {
        Ok(Self {
            oracle,
            retry: RetryPolicy::from_settings(settings),
            instruction: prompts::render_extraction(&settings.prompts.extraction)?,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the two-message request: fixed instruction, then the transcript.
    /// System turns of the chat itself are left out of the transcript.
    pub fn build_request(&self, history: &[Message]) -> Vec<Message> {
        let chat: Vec<Message> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        vec![
            Message::system(self.instruction.clone()),
            Message::user(format!(
                "{}{}",
                prompts::EXTRACTION_REQUEST_PREFIX,
                transcript(&chat)
            )),
        ]
    }

    #[instrument(skip_all, fields(messages = history.len()))]
    pub async fn extract(&self, history: &[Message]) -> Result<ExtractedParameters> {
        let request = self.build_request(history);
        let oracle = &self.oracle;
        let request = &request;

        let reply = self
            .retry
            .run("parameter extraction", move || {
                oracle.generate(request, ResponseFormat::Json)
            })
            .await?;
        debug!(%reply, "Extraction reply");

        let params = parse_reply(&reply)?;
        info!(present = ?params.present(), missing = ?params.missing(), "Extracted pricing parameters");
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;
    use std::time::Duration;

    fn extractor(oracle: &ScriptedOracle, attempts: u32) -> ParameterExtractor {
        ParameterExtractor::new(Arc::new(oracle.clone()), &Settings::default())
            .unwrap()
            .with_retry(
                RetryPolicy::new(attempts)
                    .with_backoff(Duration::from_millis(1), Duration::from_millis(2)),
            )
    }

    #[test]
    fn test_parse_partial_reply() {
        let params =
            parse_reply(r#"{"material_cost": 20, "hours_worked": 3.5, "labor_rate": null}"#).unwrap();
        assert_eq!(params.material_cost, Some(20.0));
        assert_eq!(params.hours_worked, Some(3.5));
        assert_eq!(
            params.missing(),
            vec![
                PricingField::LaborRate,
                PricingField::Uniqueness,
                PricingField::Demand,
                PricingField::ProfitMargin
            ]
        );
        assert!(params.to_inputs().is_none());
    }

    #[test]
    fn test_parse_full_reply_in_code_fence() {
        let reply = "```json\n{\"material_cost\": 20, \"hours_worked\": 3, \"labor_rate\": 15, \
                     \"uniqueness\": 7.04, \"demand\": 6, \"profit_margin\": 0.3, \
                     \"explanation\": \"Stated directly.\"}\n```";
        let params = parse_reply(reply).unwrap();
        assert!(params.is_complete());
        assert_eq!(params.uniqueness, Some(7.0));
        assert_eq!(params.explanation.as_deref(), Some("Stated directly."));
        let inputs = params.to_inputs().unwrap();
        assert_eq!(inputs.profit_margin, 0.3);
    }

    #[test]
    fn test_parse_accepts_numeric_strings_and_percentages() {
        let params =
            parse_reply(r#"{"material_cost": "$12.50", "profit_margin": "30%", "demand": ""}"#)
                .unwrap();
        assert_eq!(params.material_cost, Some(12.5));
        assert_eq!(params.profit_margin, Some(0.3));
        assert_eq!(params.demand, None);
    }

    #[test]
    fn test_parse_leaves_fractional_margin_alone() {
        let params = parse_reply(r#"{"profit_margin": 0.45}"#).unwrap();
        assert_eq!(params.profit_margin, Some(0.45));
        let params = parse_reply(r#"{"profit_margin": 150}"#).unwrap();
        assert_eq!(params.profit_margin, Some(150.0));
    }

    #[test]
    fn test_parse_percent_string_is_always_a_percentage() {
        let params = parse_reply(r#"{"profit_margin": "0.5%"}"#).unwrap();
        assert!((params.profit_margin.unwrap() - 0.005).abs() < 1e-12);
        let params = parse_reply(r#"{"profit_margin": "45 %"}"#).unwrap();
        assert!((params.profit_margin.unwrap() - 0.45).abs() < 1e-12);
        // A bare 0.5 is already a fraction.
        let params = parse_reply(r#"{"profit_margin": "0.5"}"#).unwrap();
        assert_eq!(params.profit_margin, Some(0.5));
    }

    #[test]
    fn test_parse_strips_thousands_separators() {
        let params =
            parse_reply(r#"{"material_cost": "$1,200", "labor_rate": "1,250.50"}"#).unwrap();
        assert_eq!(params.material_cost, Some(1200.0));
        assert_eq!(params.labor_rate, Some(1250.5));
    }

    #[test]
    fn test_unreadable_field_is_absent_and_keeps_the_rest() {
        let params = parse_reply(
            r#"{"material_cost": 20, "hours_worked": "a few", "labor_rate": [15], "demand": true, "uniqueness": 6}"#,
        )
        .unwrap();
        assert_eq!(params.material_cost, Some(20.0));
        assert_eq!(params.uniqueness, Some(6.0));
        assert_eq!(
            params.missing(),
            vec![
                PricingField::HoursWorked,
                PricingField::LaborRate,
                PricingField::Demand,
                PricingField::ProfitMargin
            ]
        );
    }

    #[test]
    fn test_parse_single_line_code_fence() {
        for reply in [
            r#"```{"material_cost": 5}```"#,
            r#"```json{"material_cost": 5}```"#,
            "```\n{\"material_cost\": 5}\n```",
            "```json\n{\"material_cost\": 5}\n```",
        ] {
            let params = parse_reply(reply).unwrap_or_else(|e| panic!("{reply}: {e}"));
            assert_eq!(params.material_cost, Some(5.0), "{reply}");
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for reply in [
            "I think it costs about twenty dollars",
            "[1, 2, 3]",
            "```\n```",
        ] {
            assert!(
                matches!(parse_reply(reply), Err(Error::MalformedResponse(_))),
                "accepted {reply}"
            );
        }
    }

    #[test]
    fn test_request_skips_system_turns() {
        let oracle = ScriptedOracle::new();
        let history = vec![
            Message::system("advisor prompt"),
            Message::user("Materials were $20"),
            Message::assistant("How many hours?"),
        ];
        let request = extractor(&oracle, 1).build_request(&history);

        assert_eq!(request.len(), 2);
        assert_eq!(request[0].role, Role::System);
        assert!(request[0].content.contains("profit_margin"));
        assert!(request[1].content.ends_with("User: Materials were $20\nAssistant: How many hours?"));
        assert!(!request[1].content.contains("advisor prompt"));
    }

    #[tokio::test]
    async fn test_extract_only_mentioned_fields() {
        let oracle = ScriptedOracle::new().with_reply(
            r#"{"material_cost": 20, "hours_worked": 3, "labor_rate": null, "uniqueness": null, "demand": null, "profit_margin": null}"#,
        );
        let history = vec![Message::user("Materials cost $20 and it took 3 hours")];

        let params = extractor(&oracle, 3).extract(&history).await.unwrap();
        assert_eq!(
            params.present(),
            vec![PricingField::MaterialCost, PricingField::HoursWorked]
        );
        assert_eq!(params.missing().len(), 4);
        assert_eq!(oracle.calls()[0].format, ResponseFormat::Json);
    }

    #[tokio::test]
    async fn test_extract_retries_transient_failures() {
        let oracle = ScriptedOracle::new()
            .with_error(Error::UpstreamUnavailable("502".into()))
            .with_error(Error::UpstreamUnavailable("timeout".into()))
            .with_reply(r#"{"material_cost": 5}"#);

        let params = extractor(&oracle, 3).extract(&[Message::user("hi")]).await.unwrap();
        assert_eq!(params.material_cost, Some(5.0));
        assert_eq!(oracle.call_count(), 3);
    }

    #[tokio::test]
    async fn test_extract_gives_up_after_max_attempts() {
        let oracle = ScriptedOracle::new();
        for _ in 0..5 {
            oracle.push_error(Error::UpstreamUnavailable("down".into()));
        }

        let result = extractor(&oracle, 3).extract(&[Message::user("hi")]).await;
        assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
        assert_eq!(oracle.call_count(), 3);
    }

    #[tokio::test]
    async fn test_extract_does_not_retry_auth_or_parse_errors() {
        let oracle = ScriptedOracle::new()
            .with_error(Error::UpstreamAuthError("401".into()))
            .with_reply("not json");
        let extractor = extractor(&oracle, 3);

        let first = extractor.extract(&[Message::user("hi")]).await;
        assert!(matches!(first, Err(Error::UpstreamAuthError(_))));
        assert_eq!(oracle.call_count(), 1);

        let second = extractor.extract(&[Message::user("hi")]).await;
        assert!(matches!(second, Err(Error::MalformedResponse(_))));
        assert_eq!(oracle.call_count(), 2);
    }
}
