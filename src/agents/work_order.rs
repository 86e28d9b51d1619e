//! WorkOrder：选取维修单、核对 BOM、派技术员、建工单

use serde_json::json;

use crate::core::error::OrchestratorError;
use crate::core::state::{PartRequirement, StateDelta, WorkUpdate};
use crate::plant::{BomLine, Technician, Ticket, WorkOrder};

use super::{describe_parts, AgentContext, AgentStep};

pub(super) async fn run(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let agent = ctx.agent();

    let ticket = match select_ticket(ctx).await? {
        Ok(ticket) => ticket,
        Err(reason) => {
            return Ok(AgentStep::new(StateDelta::new().clear_intent().answer(reason.clone())).say(agent, reason))
        }
    };

    let bom: Vec<BomLine> = ctx
        .scope
        .invoke_as("machines.bom", json!({ "machine_code": ticket.machine_code }))
        .await?;
    let required = required_parts(&ticket, &bom);
    let off_bom: Vec<&str> = required
        .iter()
        .filter(|p| !bom.iter().any(|l| l.part_number == p.part_number))
        .map(|p| p.part_number.as_str())
        .collect();
    if !off_bom.is_empty() {
        tracing::warn!(ticket = %ticket.number, parts = ?off_bom, "ticket lists parts outside the machine BOM");
    }

    let Some(technician) = pick_technician(ctx, ticket.specialization.as_deref()).await? else {
        let reason = format!("No technician is available for {}; the ticket stays open.", ticket.number);
        let delta = StateDelta::new()
            .clear_intent()
            .finding(reason.clone())
            .answer(reason.clone());
        return Ok(AgentStep::new(delta).say(agent, reason));
    };

    let result = ctx
        .scope
        .invoke(
            "work_orders.create",
            json!({
                "ticket_number": ticket.number,
                "technician_id": technician.id,
                "description": ticket.title,
                "parts": required,
            }),
        )
        .await?;
    let work_order: WorkOrder = serde_json::from_value(result.clone()).map_err(|e| OrchestratorError::AgentFailed {
        agent: agent.to_string(),
        message: format!("unexpected work order shape: {e}"),
    })?;

    let mut finding = format!(
        "Work order {} created for {} ({}) and assigned to {} ({})",
        work_order.number, ticket.number, ticket.machine_code, technician.name, technician.id
    );
    if !required.is_empty() {
        finding.push_str(&format!("; parts: {}", describe_parts(&required)));
    }
    if !off_bom.is_empty() {
        finding.push_str(&format!("; not on machine BOM: {}", off_bom.join(", ")));
    }

    let delta = StateDelta::new()
        .intent("parts_check")
        .update(WorkUpdate::Ticket {
            ticket_id: ticket.number.clone(),
            machine_id: ticket.machine_code.clone(),
        })
        .update(WorkUpdate::WorkOrder {
            work_order_id: work_order.number.clone(),
            technician_id: technician.id.clone(),
        })
        .update(WorkUpdate::RequiredParts(required))
        .finding(finding.clone());
    Ok(AgentStep::new(delta)
        .tool("work_orders.create", result)
        .say(agent, finding))
}

/// 指定的维修单，或按优先级排序的第一张未派工维修单；找不到时返回给用户的说明
async fn select_ticket(ctx: &AgentContext<'_>) -> Result<Result<Ticket, String>, OrchestratorError> {
    if let Some(number) = &ctx.state.work.ticket_id {
        let ticket = match ctx
            .scope
            .invoke_as::<Ticket>("tickets.get", json!({ "ticket_number": number }))
            .await
        {
            Ok(ticket) => ticket,
            Err(OrchestratorError::CapabilityFailed { message, .. }) => return Ok(Err(message)),
            Err(e) => return Err(e),
        };
        if !ticket.status.is_active() {
            return Ok(Err(format!(
                "Ticket {} is already {}; nothing to dispatch.",
                ticket.number,
                ticket.status.as_str()
            )));
        }
        return Ok(Ok(ticket));
    }
    let open: Vec<Ticket> = ctx
        .scope
        .invoke_as("tickets.list_open", json!({ "unassigned_only": true }))
        .await?;
    Ok(open
        .into_iter()
        .next()
        .ok_or_else(|| "There are no open unassigned tickets to dispatch.".to_string()))
}

/// 维修单自带备件清单优先；否则取机器 BOM
fn required_parts(ticket: &Ticket, bom: &[BomLine]) -> Vec<PartRequirement> {
    if !ticket.parts.is_empty() {
        return ticket.parts.clone();
    }
    bom.iter()
        .map(|l| PartRequirement {
            part_number: l.part_number.clone(),
            quantity: l.quantity,
        })
        .collect()
}

/// 先按专业匹配，无人时退回任意可用技术员
async fn pick_technician(
    ctx: &AgentContext<'_>,
    specialization: Option<&str>,
) -> Result<Option<Technician>, OrchestratorError> {
    if let Some(spec) = specialization {
        let matching: Vec<Technician> = ctx
            .scope
            .invoke_as("technicians.available", json!({ "specialization": spec }))
            .await?;
        if let Some(t) = matching.into_iter().next() {
            return Ok(Some(t));
        }
        tracing::info!(specialization = %spec, "no specialist available, falling back to any technician");
    }
    let any: Vec<Technician> = ctx.scope.invoke_as("technicians.available", json!({})).await?;
    Ok(any.into_iter().next())
}
