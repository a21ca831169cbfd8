//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - chat: One-shot question or interactive conversation
//! - config show / config path: Inspect configuration
//! - doctor: Check sensors, data sources and backend availability

use anyhow::{Context, Result};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{Config, PressureConfig};
use crate::llm::{Message, MessageRole, ModelBackend, ModelSession, SessionSchema};
use crate::message_bus::{Event, EventType, MessageBus};
use crate::platform::{read_meminfo, MeminfoWarningSource, SysfsThermalSensor};
use crate::pressure::{PressureMonitor, PressureSettings};
use crate::prompt::{HealthPromptAssembler, PromptAssembler};
use crate::session::{GenerationSettings, RunOutcome, SessionManager};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Build a session manager from configuration
pub fn build_session(config: &Config) -> Result<SessionManager> {
    let backend =
        ModelSession::from_config(&config.backend).context("Failed to create model backend")?;
    let assembler = Arc::new(HealthPromptAssembler::from_config(&config.prompt));

    Ok(SessionManager::new(
        backend,
        assembler,
        GenerationSettings::from_config(&config.generation),
        MessageBus::new(),
    ))
}

/// Pressure monitor reading this machine's sensors
pub fn host_pressure_monitor(config: &PressureConfig) -> PressureMonitor {
    let memory = MeminfoWarningSource::new(
        config.memory_warning_ratio,
        Duration::from_secs(config.memory_poll_interval_secs),
    );

    PressureMonitor::new(
        PressureSettings::from_config(config),
        Box::new(memory),
        Arc::new(SysfsThermalSensor::new()),
    )
}

/// Chat with the model
///
/// With a prompt, asks once and exits. Without one, reads questions from
/// stdin until `/quit` or end of input. Ctrl-C cancels a running answer;
/// at the input prompt it quits.
pub async fn handle_chat(
    prompt: Option<String>,
    warm_up: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let session = build_session(config)?;

    session
        .prepare(SessionSchema::default().with_warm_up(warm_up))
        .await
        .context("Failed to prepare session")?;

    let mut monitor = host_pressure_monitor(&config.pressure);
    let pressure_target = session.clone();
    monitor.start(move |event| pressure_target.on_pressure(event))?;

    let result = match prompt {
        Some(prompt) => one_shot(&session, prompt, format).await,
        None => interactive(&session).await,
    };

    monitor.stop();
    result
}

async fn one_shot(session: &SessionManager, prompt: String, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let mut stdout = std::io::stdout();
            let answer = ask(session, prompt, Some(&mut stdout as &mut dyn Write)).await?;
            report_outcome(&answer.outcome);
        }
        OutputFormat::Json => {
            let answer = ask(session, prompt, None).await?;
            let output = json!({
                "reply": answer.reply,
                "outcome": answer.outcome.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn interactive(session: &SessionManager) -> Result<()> {
    println!(
        "Vitalis chat ({} backend). Commands: /reset, /note <text>, /quit",
        session.backend_name()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset().await.context("Failed to reset conversation")?;
                println!("Conversation cleared.");
            }
            _ if line.starts_with("/note ") => {
                session.append_note(line.trim_start_matches("/note ").trim());
                println!("Note added.");
            }
            _ if line.starts_with('/') => println!("Unknown command: {}", line),
            question => {
                let out = Some(&mut stdout as &mut dyn Write);
                let answer = ask(session, question.to_string(), out).await?;
                report_outcome(&answer.outcome);
            }
        }
    }

    Ok(())
}

/// Reply to one question and how its run ended
#[derive(Debug)]
struct Answer {
    outcome: RunOutcome,
    reply: String,
}

/// Assistant text written after one question
///
/// Read from conversation snapshots, so output stays complete when bus
/// events are dropped.
#[derive(Debug)]
struct ReplyTracker {
    question_seq: u64,
    printed: usize,
}

impl ReplyTracker {
    fn new(question_seq: u64) -> Self {
        Self {
            question_seq,
            printed: 0,
        }
    }

    fn reply(&self, conversation: &[Message]) -> String {
        conversation
            .iter()
            .filter(|m| m.seq > self.question_seq && m.role == MessageRole::Assistant)
            .map(|m| m.content.as_str())
            .collect()
    }

    /// Reply text not yet returned by an earlier call
    fn take_new(&mut self, conversation: &[Message]) -> String {
        let reply = self.reply(conversation);
        let new = reply.get(self.printed..).unwrap_or_default().to_string();
        self.printed += new.len();
        new
    }
}

/// What Ctrl-C does while a reply is streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    /// First press: ask the run to stop
    Cancel,
    /// Second press: the backend is not yielding, leave now
    Exit,
}

#[derive(Debug, Default)]
struct InterruptState {
    canceled: bool,
}

impl InterruptState {
    fn press(&mut self) -> InterruptAction {
        if self.canceled {
            InterruptAction::Exit
        } else {
            self.canceled = true;
            InterruptAction::Cancel
        }
    }
}

/// Send one user message and wait for the run to end
///
/// The run's end is taken from the session status, never from bus events.
/// Flush events only prompt a redraw of whatever the conversation holds.
async fn ask(
    session: &SessionManager,
    question: String,
    mut out: Option<&mut dyn Write>,
) -> Result<Answer> {
    let mut flushes = session.bus().subscribe(EventType::GenerationFlushed);
    let mut pressure = session.bus().subscribe(EventType::PressureSignal);
    let mut tracker = ReplyTracker::new(session.append_user(question));
    session.start_generation()?;

    let idle = session.wait_until_idle();
    tokio::pin!(idle);
    let mut interrupts = InterruptState::default();

    let outcome = loop {
        tokio::select! {
            outcome = &mut idle => break outcome.unwrap_or(RunOutcome::Canceled),
            Some(_) = flushes.recv() => {
                if let Some(out) = out.as_deref_mut() {
                    write!(out, "{}", tracker.take_new(&session.conversation()))?;
                    out.flush()?;
                }
            }
            Some(Event::PressureSignal { event }) = pressure.recv() => {
                eprintln!("\n[{}: stopping generation]", event);
            }
            _ = tokio::signal::ctrl_c() => match interrupts.press() {
                InterruptAction::Cancel => {
                    session.cancel_generation();
                }
                InterruptAction::Exit => {
                    eprintln!("\n[aborted]");
                    std::process::exit(130);
                }
            },
        }
    };

    let conversation = session.conversation();
    if let Some(out) = out.as_deref_mut() {
        write!(out, "{}", tracker.take_new(&conversation))?;
        out.flush()?;
    }

    Ok(Answer {
        outcome,
        reply: tracker.reply(&conversation),
    })
}

fn report_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed => println!(),
        RunOutcome::Canceled => println!("\n[generation canceled]"),
        RunOutcome::Errored(reason) => {
            println!();
            eprintln!("Generation failed: {}", reason);
        }
    }
}

/// Print the effective configuration
pub fn handle_config_show(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let text = toml::to_string_pretty(config).context("Failed to serialize config")?;
            print!("{}", text);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
    }
    Ok(())
}

/// Print the configuration file path in use
pub fn handle_config_path(custom: Option<&PathBuf>, format: OutputFormat) -> Result<()> {
    let path = match custom {
        Some(path) => path.clone(),
        None => Config::default_config_path()?,
    };

    match format {
        OutputFormat::Text => println!("{}", path.display()),
        OutputFormat::Json => println!("{}", json!({ "path": path })),
    }
    Ok(())
}

/// Run system diagnostics
///
/// Reports thermal level, memory pressure, prompt data and whether the
/// configured backend can be set up.
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(&str, String)> = Vec::new();

    // Check 1: Configuration validation
    // Config is already validated when loaded
    checks.push(("Configuration", "Valid".to_string()));

    // Check 2: Thermal sensor
    match SysfsThermalSensor::new().max_celsius().await {
        Ok(celsius) => {
            let level = crate::platform::level_for_celsius(celsius);
            checks.push(("Thermal level", format!("{} ({:.1}°C)", level, celsius)));
            if level >= config.pressure.thermal_cancel_level {
                issues.push(format!(
                    "Thermal level {} would cancel generation immediately",
                    level
                ));
            }
        }
        Err(e) => {
            checks.push(("Thermal level", "Unavailable".to_string()));
            issues.push(format!("Thermal checks will be skipped: {}", e));
        }
    }

    // Check 3: Memory pressure
    match read_meminfo().await {
        Ok(info) => {
            let pressure = info.pressure();
            checks.push(("Memory in use", format!("{:.0}%", pressure * 100.0)));
            if pressure >= config.pressure.memory_warning_ratio {
                issues.push(format!(
                    "Memory use is above the warning ratio ({:.0}%)",
                    config.pressure.memory_warning_ratio * 100.0
                ));
            }
        }
        Err(e) => {
            checks.push(("Memory in use", "Unavailable".to_string()));
            issues.push(format!("Memory warnings will not fire: {}", e));
        }
    }

    // Check 4: System prompt and health data
    let assembler = HealthPromptAssembler::from_config(&config.prompt);
    match assembler.build_system_prompt().await {
        Ok(prompt) => checks.push((
            "System prompt",
            format!("{} chars", prompt.chars().count()),
        )),
        Err(e) => {
            checks.push(("System prompt", "Failed".to_string()));
            issues.push(e.to_string());
        }
    }

    // Check 5: Model backend
    match ModelSession::from_config(&config.backend) {
        Ok(backend) => match backend.setup(&SessionSchema::default()).await {
            Ok(()) => checks.push(("Backend", format!("{} (ready)", backend.name()))),
            Err(e) => {
                checks.push(("Backend", format!("{} (unavailable)", backend.name())));
                issues.push(e.to_string());
            }
        },
        Err(e) => {
            checks.push(("Backend", "Misconfigured".to_string()));
            issues.push(e.to_string());
        }
    }

    // Output results
    match format {
        OutputFormat::Text => {
            println!("Vitalis System Diagnostics");
            println!("============================");
            println!();

            println!("System Checks:");
            for (check, status) in &checks {
                println!("  {:<25} {}", format!("{}:", check), status);
            }

            println!();

            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": issues,
                "healthy": issues.is_empty()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_session_with_scripted_backend() {
        let mut config = Config::default_config();
        config.backend.kind = "scripted".to_string();
        config.backend.scripted.fragment_delay_ms = 0;

        let session = build_session(&config).unwrap();
        assert_eq!(session.backend_name(), "scripted");

        session.prepare(SessionSchema::default()).await.unwrap();
        session.append_user("How am I doing?");
        session.start_generation().unwrap();
        assert_eq!(session.wait_until_idle().await, Some(RunOutcome::Completed));

        let reply = session.conversation().pop().unwrap();
        assert_eq!(reply.role, MessageRole::Assistant);
        assert_eq!(reply.content, config.backend.scripted.reply);
    }

    #[tokio::test]
    async fn test_ask_completes_despite_lagging_subscriber() {
        let mut config = Config::default_config();
        config.backend.kind = "scripted".to_string();
        config.backend.scripted.reply = (0..150).map(|i| format!("w{} ", i)).collect();
        config.backend.scripted.fragment_delay_ms = 1;
        config.generation.flush_min_chars = 1;

        let session = build_session(&config).unwrap();
        session.prepare(SessionSchema::default()).await.unwrap();

        // Never read: fills after 100 events and drops the rest
        let _lagging = session.bus().subscribe(EventType::All);

        let mut printed: Vec<u8> = Vec::new();
        let answer = tokio::time::timeout(
            Duration::from_secs(30),
            ask(&session, "Summarize".to_string(), Some(&mut printed as &mut dyn Write)),
        )
        .await
        .expect("ask did not return")
        .unwrap();

        assert_eq!(answer.outcome, RunOutcome::Completed);
        assert_eq!(answer.reply, config.backend.scripted.reply);
        assert_eq!(String::from_utf8(printed).unwrap(), config.backend.scripted.reply);
    }

    #[tokio::test]
    async fn test_ask_without_output_returns_reply() {
        let mut config = Config::default_config();
        config.backend.kind = "scripted".to_string();
        config.backend.scripted.fragment_delay_ms = 0;

        let session = build_session(&config).unwrap();
        session.prepare(SessionSchema::default()).await.unwrap();

        let answer = ask(&session, "Hi".to_string(), None).await.unwrap();
        assert_eq!(answer.outcome, RunOutcome::Completed);
        assert_eq!(answer.reply, config.backend.scripted.reply);
    }

    #[test]
    fn test_reply_tracker_returns_only_new_text() {
        let mut conversation = vec![
            Message {
                seq: 0,
                ..Message::system("prompt")
            },
            Message {
                seq: 1,
                ..Message::assistant("old answer")
            },
            Message {
                seq: 2,
                ..Message::user("question")
            },
            Message {
                seq: 3,
                ..Message::assistant("Drink ")
            },
        ];
        let mut tracker = ReplyTracker::new(2);

        assert_eq!(tracker.take_new(&conversation), "Drink ");
        assert_eq!(tracker.take_new(&conversation), "");

        conversation[3].content.push_str("water.");
        assert_eq!(tracker.take_new(&conversation), "water.");
        assert_eq!(tracker.reply(&conversation), "Drink water.");
    }

    #[test]
    fn test_second_interrupt_exits() {
        let mut interrupts = InterruptState::default();
        assert_eq!(interrupts.press(), InterruptAction::Cancel);
        assert_eq!(interrupts.press(), InterruptAction::Exit);
        assert_eq!(interrupts.press(), InterruptAction::Exit);
    }

    #[tokio::test]
    async fn test_host_pressure_monitor_starts_and_stops() {
        let mut monitor = host_pressure_monitor(&PressureConfig::default());
        monitor.start(|_| {}).unwrap();
        assert!(monitor.is_running());
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
