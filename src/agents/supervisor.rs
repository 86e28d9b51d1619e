//! Supervisor：意图分类、一般问答、最终汇总

use crate::capability::{ActionSpec, OraclePurpose, OracleRequest};
use crate::core::error::OrchestratorError;
use crate::core::router::USER_INTENTS;
use crate::core::state::{StateDelta, WorkUpdate};

use super::{AgentContext, AgentStep};

fn intent_description(intent: &str) -> &'static str {
    match intent {
        "execute_maintenance" => "Work through today's open maintenance tickets",
        "execute_single_ticket" => "Execute one named maintenance ticket",
        "inventory_query" => "Question about spare part stock levels",
        "ticket_query" => "Question about maintenance tickets",
        "priority_query" => "Question about ticket priorities",
        "work_order_review" => "Technician review or close-out of a named work order",
        "email_report" => "Send a maintenance status report by email",
        _ => "Anything else; answer directly",
    }
}

pub(super) async fn run(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    match ctx.intent() {
        Some("summarize") => Ok(summarize(ctx)),
        Some("general_qa") => answer(ctx).await,
        _ => classify(ctx).await,
    }
}

async fn classify(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let input = ctx.user_text.clone().unwrap_or_default();
    let decision = ctx
        .scope
        .ask(OracleRequest {
            agent: ctx.agent(),
            purpose: OraclePurpose::ClassifyIntent,
            instruction: "Classify the maintenance request into exactly one intent. \
                          Put a named ticket_number or work_order_id into arguments."
                .to_string(),
            input,
            context: ctx.window.to_vec(),
            actions: USER_INTENTS
                .iter()
                .map(|i| ActionSpec::new(*i, intent_description(i)))
                .collect(),
        })
        .await?;

    let intent = if USER_INTENTS.contains(&decision.action.as_str()) {
        decision.action.as_str()
    } else {
        tracing::warn!(action = %decision.action, "oracle returned unknown intent, treating as general_qa");
        "general_qa"
    };

    let mut delta = StateDelta::new().intent(intent);
    if let Some(ticket) = decision.argument_str("ticket_number") {
        delta = delta.update(WorkUpdate::RequestedTicket(ticket.to_string()));
    }
    if let Some(wo) = decision.argument_str("work_order_id") {
        delta = delta.update(WorkUpdate::RequestedWorkOrder(wo.to_string()));
    }
    let note = if decision.rationale.is_empty() {
        format!("Routing request as {intent}.")
    } else {
        format!("Routing request as {intent}: {}", decision.rationale)
    };
    Ok(AgentStep::new(delta).say(ctx.agent(), note))
}

async fn answer(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let decision = ctx
        .scope
        .ask(OracleRequest {
            agent: ctx.agent(),
            purpose: OraclePurpose::Answer,
            instruction: "Answer the user's question briefly; put the answer in rationale.".to_string(),
            input: ctx.user_text.clone().unwrap_or_default(),
            context: ctx.window.to_vec(),
            actions: vec![ActionSpec::new("answer", "Reply to the user")],
        })
        .await?;
    let text = if decision.rationale.trim().is_empty() {
        "I can help with stock levels, tickets, work orders and maintenance reports.".to_string()
    } else {
        decision.rationale
    };
    Ok(AgentStep::new(StateDelta::new().clear_intent().answer(text.clone())).say(ctx.agent(), text))
}

fn summarize(ctx: &AgentContext<'_>) -> AgentStep {
    let work = &ctx.state.work;
    let mut text = if work.findings.is_empty() {
        "No further action was needed.".to_string()
    } else {
        format!("Summary:\n{}", super::bullet_list(&work.findings, |f| f.clone()))
    };
    if let Some(action) = work.technician_action {
        text.push_str(&format!("\nTechnician decision: {action}."));
    }
    AgentStep::new(StateDelta::new().clear_intent().answer(text.clone())).say(ctx.agent(), text)
}
