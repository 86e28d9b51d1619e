//! Inventory：临时查询（库存、维修单、优先级）与工单备件校验发放

use serde_json::{json, Value};

use crate::capability::{OraclePurpose, OracleRequest, SideEffect};
use crate::core::error::OrchestratorError;
use crate::core::state::{PartRequirement, StateDelta, WorkUpdate};
use crate::plant::{BomLine, Part, PartIssue, Ticket, WorkOrder};

use super::{bullet_list, describe_part, describe_parts, describe_ticket, describe_work_order, AgentContext, AgentStep};

pub(super) async fn run(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    match ctx.intent() {
        Some("parts_check") => parts_check(ctx).await,
        _ => query(ctx).await,
    }
}

/// oracle 挑选一个只读能力并给出参数；结果格式化为最终答复
async fn query(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let actions = ctx.scope.gateway().read_actions(ctx.agent());
    let decision = ctx
        .scope
        .ask(OracleRequest {
            agent: ctx.agent(),
            purpose: OraclePurpose::SelectQuery,
            instruction: "Pick the one read-only query that answers the user's question, with its arguments."
                .to_string(),
            input: ctx.user_text.clone().unwrap_or_default(),
            context: ctx.window.to_vec(),
            actions: actions.clone(),
        })
        .await?;

    let capability = decision.action.clone();
    // 查询路径只执行候选中的只读能力
    let offered = actions.iter().any(|a| a.name == capability);
    if !offered || ctx.scope.gateway().side_effect(&capability) != Some(SideEffect::ReadOnly) {
        tracing::warn!(agent = %ctx.agent(), %capability, "oracle picked a capability outside the read-only query set");
        let answer = format!("I can only answer questions with read-only lookups; '{capability}' is not one of them.");
        return Ok(AgentStep::new(StateDelta::new().clear_intent().answer(answer.clone())).say(ctx.agent(), answer));
    }
    let answer = match ctx.scope.invoke(&capability, decision.arguments.clone()).await {
        Ok(result) => {
            let text = format_result(&capability, &result);
            let step = AgentStep::new(StateDelta::new().clear_intent().answer(text.clone()))
                .tool(&capability, result)
                .say(ctx.agent(), text);
            return Ok(step);
        }
        Err(OrchestratorError::CapabilityFailed { message, .. }) => message,
        Err(OrchestratorError::InvalidCapabilityArguments { message, .. }) => {
            format!("I could not work out which record you meant ({message}).")
        }
        Err(e) => return Err(e),
    };
    Ok(AgentStep::new(StateDelta::new().clear_intent().answer(answer.clone())).say(ctx.agent(), answer))
}

fn format_result(capability: &str, result: &Value) -> String {
    let parsed = match capability {
        "inventory.lookup_part" => serde_json::from_value::<Part>(result.clone())
            .map(|p| format!("{}.", describe_part(&p))),
        "inventory.low_stock" => serde_json::from_value::<Vec<Part>>(result.clone()).map(|parts| {
            if parts.is_empty() {
                "No parts are at or below their reorder point.".to_string()
            } else {
                format!(
                    "{} parts at or below reorder point:\n{}",
                    parts.len(),
                    bullet_list(&parts, describe_part)
                )
            }
        }),
        "tickets.list_open" => serde_json::from_value::<Vec<Ticket>>(result.clone()).map(|tickets| {
            if tickets.is_empty() {
                "There are no open maintenance tickets.".to_string()
            } else {
                format!(
                    "{} open tickets by priority:\n{}",
                    tickets.len(),
                    bullet_list(&tickets, describe_ticket)
                )
            }
        }),
        "tickets.get" => serde_json::from_value::<Ticket>(result.clone()).map(|t| describe_ticket(&t)),
        "machines.bom" => serde_json::from_value::<Vec<BomLine>>(result.clone()).map(|lines| {
            let machine = lines.first().map(|l| l.machine_code.clone()).unwrap_or_default();
            format!(
                "Bill of materials for {machine}:\n{}",
                bullet_list(&lines, |l| format!("{} x{}", l.part_number, l.quantity))
            )
        }),
        "work_orders.get" => serde_json::from_value::<WorkOrder>(result.clone()).map(|w| describe_work_order(&w)),
        _ => serde_json::to_string_pretty(result),
    };
    parsed.unwrap_or_else(|_| result.to_string())
}

/// 逐项校验工单所需备件：有货即发料，缺货记录给采购
async fn parts_check(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let work = &ctx.state.work;
    let mut step = AgentStep::default();
    let mut issued: Vec<PartRequirement> = Vec::new();
    let mut shortages: Vec<PartRequirement> = Vec::new();
    let mut unknown: Vec<String> = Vec::new();

    for need in &work.required_parts {
        let lookup = ctx
            .scope
            .invoke_as::<Part>("inventory.lookup_part", json!({ "part_number": need.part_number }))
            .await;
        let part = match lookup {
            Ok(part) => part,
            Err(OrchestratorError::CapabilityFailed { message, .. }) => {
                tracing::warn!(part = %need.part_number, %message, "unknown part skipped");
                unknown.push(need.part_number.clone());
                continue;
            }
            Err(e) => return Err(e),
        };
        if part.on_hand < need.quantity {
            tracing::info!(part = %need.part_number, on_hand = part.on_hand, needed = need.quantity, "part short");
            shortages.push(need.clone());
            continue;
        }
        let args = json!({
            "part_number": need.part_number,
            "quantity": need.quantity,
            "work_order_id": work.work_order_id,
        });
        match ctx.scope.invoke("inventory.issue_part", args).await {
            Ok(result) => {
                if let Ok(issue) = serde_json::from_value::<PartIssue>(result.clone()) {
                    tracing::info!(part = %issue.part_number, remaining = issue.remaining, "part issued");
                }
                issued.push(need.clone());
                step = step.tool("inventory.issue_part", result);
            }
            Err(OrchestratorError::CapabilityFailed { message, .. }) => {
                tracing::warn!(part = %need.part_number, %message, "issue failed, recording shortage");
                shortages.push(need.clone());
            }
            Err(e) => return Err(e),
        }
    }

    let mut summary = Vec::new();
    if work.required_parts.is_empty() {
        summary.push("No parts required".to_string());
    }
    if !issued.is_empty() {
        summary.push(format!("Issued {}", describe_parts(&issued)));
    }
    if !shortages.is_empty() {
        summary.push(format!("Out of stock: {}", describe_parts(&shortages)));
    }
    if !unknown.is_empty() {
        summary.push(format!("Unknown part numbers: {}", unknown.join(", ")));
    }
    let finding = match &work.work_order_id {
        Some(wo) => format!("Parts check for {wo}: {}", summary.join("; ")),
        None => format!("Parts check: {}", summary.join("; ")),
    };

    let next = if !shortages.is_empty() {
        "procurement"
    } else if work.work_order_id.is_some() {
        "technician_review"
    } else {
        "summarize"
    };
    let delta = StateDelta::new()
        .intent(next)
        .update(WorkUpdate::IssuedParts(issued))
        .update(WorkUpdate::OutOfStock(shortages))
        .finding(finding.clone());
    step.delta = delta;
    Ok(step.say(ctx.agent(), finding))
}
