//! maint - 维护计划编排控制台
//!
//! 入口：初始化日志、组装引擎，然后逐行读取 stdin。
//! 普通文本开启新会话；`/respond <choice> [notes]` 答复挂起的技术员中断。

use std::path::PathBuf;

use anyhow::Context;
use maint::core::{create_engine_builder, DecisionPayload, Engine, RunOutcome};
use maint::observability;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "Commands:
  <text>                     start a new session with a maintenance request
  /respond <choice> [notes]  answer the pending technician prompt (complete, request_parts, reschedule, add_notes)
  /status                    show the current session
  /history                   list checkpoints of the current session
  /cancel                    cancel the current session
  /quit                      exit";

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Suspended { interrupt, .. } => {
            println!("? {}", interrupt.prompt);
            println!("  choices: {}", interrupt.choices.join(", "));
        }
        RunOutcome::Terminated { outcome, answer, .. } => {
            if let Some(answer) = answer {
                println!("{answer}");
            }
            println!("[session {outcome:?}]");
        }
    }
}

/// `/respond request_parts BLT-A42 belt worn`：含连字符与数字的词视为零件号
fn parse_response(args: &str) -> DecisionPayload {
    let mut words = args.split_whitespace();
    let Some(choice) = words.next() else {
        return DecisionPayload::default();
    };
    let rest: Vec<&str> = words.collect();
    let parts = rest
        .iter()
        .filter(|w| w.contains('-') && w.chars().any(|c| c.is_ascii_digit()))
        .map(|w| w.to_uppercase())
        .collect();
    let mut payload = DecisionPayload::choice(choice).with_parts(parts);
    if !rest.is_empty() {
        payload = payload.with_text(rest.join(" "));
    }
    payload
}

async fn handle_command(engine: &Engine, current: &mut Option<String>, line: &str) -> anyhow::Result<bool> {
    let (command, args) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{HELP}"),
        "/respond" => {
            let session = current.as_deref().context("no active session")?;
            let report = engine.resume(session).await?;
            let pending = report.pending.context("session is not waiting for a technician")?;
            let outcome = engine.respond(session, &pending.id, parse_response(args)).await?;
            print_outcome(&outcome);
        }
        "/status" => {
            let session = current.as_deref().context("no active session")?;
            let report = engine.resume(session).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "/history" => {
            let session = current.as_deref().context("no active session")?;
            for meta in engine.history(session).await? {
                println!(
                    "#{:<3} {:?} agent={} iterations={} messages={} at {}",
                    meta.step,
                    meta.status,
                    meta.current_agent.as_deref().unwrap_or("-"),
                    meta.iteration_count,
                    meta.messages,
                    meta.created_at.format("%H:%M:%S")
                );
            }
        }
        "/cancel" => {
            let session = current.take().context("no active session")?;
            let report = engine.cancel(&session).await?;
            println!("[session {} {:?}]", report.session_id, report.status);
        }
        other => println!("unknown command {other}, try /help"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let components = create_engine_builder(config_path)
        .build()
        .await
        .context("Failed to build engine")?;
    let engine = components.engine;

    println!("maint console, /help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut current: Option<String> = None;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            match handle_command(&engine, &mut current, line).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => eprintln!("error: {e:#}"),
            }
            continue;
        }
        match engine.start(None, line).await {
            Ok(outcome) => {
                current = Some(outcome.session_id().to_string());
                print_outcome(&outcome);
            }
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
    Ok(())
}
