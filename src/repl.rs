// Interactive terminal chat used by the `chat` subcommand.

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::chat::{ChatHandler, Recommendation};
use crate::conversation::Role;
use crate::error::Error;

const HELP: &str = "\
Commands:
  /recommend  price the item from what you've said so far
  /history    show the conversation
  /reset      start over
  /quit       leave
Anything else is sent to the assistant.";

pub fn render_recommendation(recommendation: &Recommendation) -> String {
    match recommendation {
        Recommendation::Ready {
            result,
            explanation,
            ..
        } => {
            let mut out = result.to_string();
            if let Some(explanation) = explanation {
                out.push_str("\n\n");
                out.push_str(explanation);
            }
            out
        }
        Recommendation::Collecting { known, missing } => {
            let mut out = String::new();
            let present = known.present();
            if !present.is_empty() {
                out.push_str("Known so far:\n");
                for field in present {
                    if let Some(value) = known.get(field) {
                        out.push_str(&format!("  {}: {}\n", field, value));
                    }
                }
            }
            let names: Vec<&str> = missing.iter().map(|f| f.as_str()).collect();
            out.push_str(&format!("Still need: {}", names.join(", ")));
            out
        }
    }
}

async fn say<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

/// Reads lines from `input` until EOF or `/quit`. Transient oracle errors are
/// reported and the loop continues; a rejected credential ends the session.
pub async fn run_chat<R, W>(handler: &mut ChatHandler, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("Starting interactive chat session...");
    say(
        &mut output,
        "Tell me about the item you'd like to price. Type /help for commands.",
    )
    .await?;

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/help" => say(&mut output, HELP).await?,
            "/reset" => {
                handler.reset();
                say(&mut output, "Conversation cleared.").await?;
            }
            "/history" => {
                for message in handler.history().iter().filter(|m| m.role != Role::System) {
                    say(&mut output, &format!("{}: {}", message.role, message.content)).await?;
                }
            }
            "/recommend" => match handler.get_recommendations().await {
                Ok(recommendation) => {
                    say(&mut output, &render_recommendation(&recommendation)).await?
                }
                Err(err @ Error::UpstreamAuthError(_)) => return Err(err.into()),
                Err(err) => {
                    warn!(error = %err, "Recommendation failed");
                    say(&mut output, &format!("Sorry, {}", err)).await?;
                }
            },
            text => match handler.send_message(text).await {
                Ok(reply) => say(&mut output, &reply).await?,
                Err(err @ Error::UpstreamAuthError(_)) => return Err(err.into()),
                Err(err) => {
                    warn!(error = %err, "Chat turn failed");
                    say(&mut output, &format!("Sorry, {}", err)).await?;
                }
            },
        }
    }

    info!("Chat session finished.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::oracle::ScriptedOracle;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    fn handler(oracle: &ScriptedOracle) -> ChatHandler {
        ChatHandler::new(Arc::new(oracle.clone()), &Settings::default())
            .unwrap()
            .with_retry(RetryPolicy::new(1).with_backoff(Duration::ZERO, Duration::ZERO))
    }

    async fn run(oracle: &ScriptedOracle, script: &str) -> (Result<()>, String) {
        let mut handler = handler(oracle);
        let mut output = Vec::new();
        let result = run_chat(&mut handler, script.as_bytes(), &mut output).await;
        (result, String::from_utf8(output).unwrap())
    }

    #[tokio::test]
    async fn test_chat_turn_and_quit() {
        let oracle = ScriptedOracle::new().with_reply("How many hours did it take?");
        let (result, output) = run(&oracle, "Materials were $20\n/quit\nignored\n").await;

        assert!(result.is_ok());
        assert!(output.contains("How many hours did it take?"));
        assert_eq!(oracle.call_count(), 1);
    }

    #[tokio::test]
    async fn test_recommend_lists_missing_fields() {
        let oracle = ScriptedOracle::new()
            .with_reply("Got it.")
            .with_reply(r#"{"material_cost": 20, "hours_worked": 3}"#);
        let (_, output) = run(&oracle, "Materials $20, 3 hours\n/recommend\n").await;

        assert!(output.contains("material_cost: 20"));
        assert!(output.contains("Still need: labor_rate, uniqueness, demand, profit_margin"));
    }

    #[tokio::test]
    async fn test_transient_error_keeps_session_alive() {
        let oracle = ScriptedOracle::new()
            .with_error(Error::UpstreamUnavailable("timeout".into()))
            .with_reply("Back again.");
        let (result, output) = run(&oracle, "hello\nhello again\n").await;

        assert!(result.is_ok());
        assert!(output.contains("Sorry, language model unavailable"));
        assert!(output.contains("Back again."));
    }

    #[tokio::test]
    async fn test_auth_error_ends_session() {
        let oracle = ScriptedOracle::new().with_error(Error::UpstreamAuthError("401".into()));
        let (result, _) = run(&oracle, "hello\n").await;
        assert!(result.is_err());
    }
}
