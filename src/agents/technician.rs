//! Technician：人在回路
//!
//! 首次运行发起中断（完成 / 请求备件 / 改期 / 备注）；答复注入后再次运行，按决定更新工单。

use serde_json::{json, Value};

use crate::capability::{ActionSpec, OraclePurpose, OracleRequest};
use crate::core::error::OrchestratorError;
use crate::core::interrupt::{InterruptController, InterruptRequest, InterruptResponse, TechnicianDecision};
use crate::core::state::{PartRequirement, StateDelta, WorkUpdate};
use crate::plant::WorkOrder;

use super::{describe_work_order, AgentContext, AgentStep};

pub(super) async fn run(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    match InterruptController::new().response_for(ctx.state, ctx.agent()) {
        Some(response) => resolve(ctx, response.clone()).await,
        None => raise(ctx).await,
    }
}

fn finish(ctx: &AgentContext<'_>, text: String) -> AgentStep {
    AgentStep::new(StateDelta::new().clear_intent().answer(text.clone())).say(ctx.agent(), text)
}

async fn raise(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let Some(wo) = ctx.state.work.work_order_id.clone() else {
        return Ok(finish(ctx, "There is no work order to review.".to_string()));
    };
    let work_order: WorkOrder = match ctx
        .scope
        .invoke_as("work_orders.get", json!({ "work_order_id": wo }))
        .await
    {
        Ok(w) => w,
        Err(OrchestratorError::CapabilityFailed { message, .. }) => return Ok(finish(ctx, message)),
        Err(e) => return Err(e),
    };

    let prompt = format!("Mark {wo} complete, request parts, or reschedule?");
    let card = json!({
        "work_order": work_order.number,
        "ticket": work_order.ticket_number,
        "machine": work_order.machine_code,
        "technician": work_order.technician_id,
        "status": work_order.status.as_str(),
        "description": work_order.description,
        "parts": work_order.parts,
        "issued_parts": ctx.state.work.issued_parts,
        "requisitions": ctx.state.work.requisition_ids,
    });
    let mut request = InterruptRequest::technician(prompt.clone(), Some(wo.clone())).with_payload(card);
    if let Some(timeout) = ctx.settings.interrupt_timeout {
        let timeout = chrono::Duration::from_std(timeout).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        request = request.with_deadline(ctx.now + timeout, ctx.settings.interrupt_default_choice.clone());
    }
    tracing::info!(work_order = %wo, interrupt = %request.id, "awaiting technician decision");
    let text = format!("{prompt}\n{}", describe_work_order(&work_order));
    Ok(AgentStep::new(StateDelta::new()).interrupt(request).say(ctx.agent(), text))
}

/// 技术员只给了自由文本时，由 oracle 解析出决定
async fn interpret(
    ctx: &AgentContext<'_>,
    response: &InterruptResponse,
) -> Result<(TechnicianDecision, Vec<String>), OrchestratorError> {
    if let Some(choice) = response.choice {
        return Ok((choice, response.parts_requested.clone()));
    }
    let text = response.text.clone().unwrap_or_default();
    let decision = ctx
        .scope
        .ask(OracleRequest {
            agent: ctx.agent(),
            purpose: OraclePurpose::ParseDecision,
            instruction: "Decide what the technician wants to do with the work order. \
                          For request_parts list part numbers in arguments.parts_requested."
                .to_string(),
            input: text,
            context: ctx.window.to_vec(),
            actions: TechnicianDecision::CHOICES
                .iter()
                .map(|c| ActionSpec::new(*c, format!("technician chose {c}")))
                .collect(),
        })
        .await?;
    let choice = decision.action.parse().unwrap_or(TechnicianDecision::AddNotes);
    let mut parts = response.parts_requested.clone();
    if let Some(Value::Array(listed)) = decision.arguments.get("parts_requested") {
        parts.extend(listed.iter().filter_map(Value::as_str).map(str::to_string));
    }
    Ok((choice, parts))
}

async fn resolve(ctx: &AgentContext<'_>, response: InterruptResponse) -> Result<AgentStep, OrchestratorError> {
    let agent = ctx.agent();
    let Some(wo) = ctx.state.work.work_order_id.clone() else {
        return Ok(finish(ctx, "There is no work order to update.".to_string()));
    };
    let (decision, requested) = interpret(ctx, &response).await?;
    let note = response.text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let suffix = if response.defaulted {
        " (default applied, no technician response)"
    } else {
        ""
    };

    let (capability, args, next, mut finding) = match decision {
        TechnicianDecision::Complete => (
            "work_orders.update_status",
            json!({ "work_order_id": wo, "status": "completed", "note": note }),
            "summarize",
            format!("{wo} marked completed by technician"),
        ),
        TechnicianDecision::Reschedule => (
            "work_orders.update_status",
            json!({ "work_order_id": wo, "status": "rescheduled", "note": note }),
            "summarize",
            format!("{wo} rescheduled{suffix}"),
        ),
        TechnicianDecision::RequestParts => (
            "work_orders.update_status",
            json!({ "work_order_id": wo, "status": "waiting_parts", "note": note }),
            "parts_check",
            format!("Technician requested parts for {wo}"),
        ),
        TechnicianDecision::AddNotes => (
            "work_orders.add_notes",
            json!({ "work_order_id": wo, "notes": note.unwrap_or("Technician acknowledged") }),
            "summarize",
            format!("Notes added to {wo}"),
        ),
    };

    let mut step = AgentStep::default();
    match ctx.scope.invoke(capability, args).await {
        Ok(result) => step = step.tool(capability, result),
        Err(OrchestratorError::CapabilityFailed { message, .. }) => {
            tracing::warn!(work_order = %wo, %message, "work order update rejected");
            finding = format!("{finding}, but the update was rejected: {message}");
        }
        Err(e) => return Err(e),
    }

    let mut delta = StateDelta::new()
        .intent(next)
        .update(WorkUpdate::TechnicianAction(decision));
    if decision == TechnicianDecision::RequestParts {
        let parts: Vec<PartRequirement> = if requested.is_empty() {
            ctx.state.work.required_parts.clone()
        } else {
            requested
                .into_iter()
                .map(|part_number| PartRequirement {
                    part_number: part_number.to_uppercase(),
                    quantity: 1,
                })
                .collect()
        };
        finding.push_str(&format!(": {}", super::describe_parts(&parts)));
        delta = delta.update(WorkUpdate::RequiredParts(parts));
    }
    if let Some(text) = note {
        finding.push_str(&format!(" (\"{text}\")"));
    }
    step.delta = delta.finding(finding.clone());
    Ok(step.say(agent, finding))
}
