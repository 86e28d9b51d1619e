//! Procurement：缺件请购单与供应商邮件
//!
//! 邮件发送失败时取消该供应商的请购单，按 priority_rank 转给下一家供应商；
//! 所有供应商都试过仍失败的零件记为无供应商可用。

use std::collections::{BTreeMap, HashMap};

use serde_json::json;

use crate::capability::NotifyOutcome;
use crate::core::error::OrchestratorError;
use crate::core::state::{StateDelta, WorkUpdate};
use crate::plant::{Requisition, Vendor};

use super::{AgentContext, AgentStep};

pub(super) async fn run(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let agent = ctx.agent();
    let work = &ctx.state.work;
    let mut step = AgentStep::default();
    let mut open: Vec<Requisition> = Vec::new();

    for shortage in &work.out_of_stock {
        let (requisition, result) = raise(ctx, &shortage.part_number, shortage.quantity, None).await?;
        step = step.tool("procurement.create_requisition", result);
        open.push(requisition);
    }

    let vendors: Vec<Vendor> = if open.is_empty() {
        Vec::new()
    } else {
        ctx.scope.invoke_as("procurement.vendors", json!({})).await?
    };
    // 每个零件已经试过的供应商
    let mut tried: HashMap<String, Vec<String>> = HashMap::new();
    let mut placed: Vec<Requisition> = Vec::new();
    let mut unfilled: Vec<String> = Vec::new();
    let mut notes = Vec::new();

    while !open.is_empty() {
        // 每个供应商一封邮件
        let mut by_vendor: BTreeMap<String, Vec<Requisition>> = BTreeMap::new();
        for r in open.drain(..) {
            by_vendor.entry(r.vendor_id.clone()).or_default().push(r);
        }
        for (vendor_id, lines) in by_vendor {
            let (delivered, result) = email_vendor(ctx, &lines).await?;
            step = step.tool("notify.send_email", result);
            let vendor_name = lines.first().map(|r| r.vendor_name.clone()).unwrap_or_default();
            match delivered {
                Ok(()) => {
                    notes.push(format!("{vendor_name} notified"));
                    placed.extend(lines);
                    continue;
                }
                Err(reason) => {
                    tracing::warn!(vendor = %vendor_id, %reason, "vendor email failed, trying next vendor");
                    notes.push(format!("email to {vendor_name} failed: {reason}"));
                }
            }

            for r in lines {
                let cancelled = ctx
                    .scope
                    .invoke("procurement.cancel_requisition", json!({ "requisition_id": r.number }))
                    .await?;
                step = step.tool("procurement.cancel_requisition", cancelled);
                notes.push(format!("{} cancelled", r.number));

                let seen = tried.entry(r.part_number.clone()).or_default();
                seen.push(vendor_id.clone());
                let next = vendors.iter().find(|v| !seen.contains(&v.id));
                match next {
                    Some(vendor) => {
                        let (requisition, result) = raise(ctx, &r.part_number, r.quantity, Some(&vendor.id)).await?;
                        step = step.tool("procurement.create_requisition", result);
                        open.push(requisition);
                    }
                    None => {
                        tracing::warn!(part = %r.part_number, "no vendor left to order from");
                        unfilled.push(r.part_number.clone());
                    }
                }
            }
        }
    }

    let ids: Vec<String> = placed.iter().map(|r| r.number.clone()).collect();
    let mut finding = if ids.is_empty() {
        "No requisitions placed".to_string()
    } else {
        format!("Requisitions raised: {}", ids.join(", "))
    };
    if !notes.is_empty() {
        finding.push_str(&format!(" ({})", notes.join("; ")));
    }
    if !unfilled.is_empty() {
        finding.push_str(&format!(". No vendor available for {}", unfilled.join(", ")));
    }

    let next = if work.work_order_id.is_some() {
        "technician_review"
    } else {
        "summarize"
    };
    step.delta = StateDelta::new()
        .intent(next)
        .update(WorkUpdate::Requisitions(ids))
        .update(WorkUpdate::OutOfStock(Vec::new()))
        .finding(finding.clone());
    Ok(step.say(agent, finding))
}

async fn raise(
    ctx: &AgentContext<'_>,
    part_number: &str,
    quantity: u32,
    vendor_id: Option<&str>,
) -> Result<(Requisition, serde_json::Value), OrchestratorError> {
    let result = ctx
        .scope
        .invoke(
            "procurement.create_requisition",
            json!({
                "part_number": part_number,
                "quantity": quantity,
                "work_order_id": ctx.state.work.work_order_id,
                "vendor_id": vendor_id,
            }),
        )
        .await?;
    let requisition = serde_json::from_value(result.clone()).map_err(|e| OrchestratorError::AgentFailed {
        agent: ctx.agent().to_string(),
        message: format!("unexpected requisition shape: {e}"),
    })?;
    Ok((requisition, result))
}

/// 给一个供应商发请购邮件；Err 为失败原因
async fn email_vendor(
    ctx: &AgentContext<'_>,
    lines: &[Requisition],
) -> Result<(Result<(), String>, serde_json::Value), OrchestratorError> {
    let Some(first) = lines.first() else {
        return Ok((Ok(()), serde_json::Value::Null));
    };
    let body = lines
        .iter()
        .map(|r| format!("{}: {} x{}", r.number, r.part_number, r.quantity))
        .collect::<Vec<_>>()
        .join("\n");
    let reference = ctx.state.work.work_order_id.as_deref().unwrap_or("stock replenishment");
    let result = ctx
        .scope
        .invoke(
            "notify.send_email",
            json!({
                "recipient": first.vendor_email,
                "subject": format!("Purchase requisition for {reference}"),
                "body": format!("Dear {},\n\nPlease quote and ship:\n{body}\n", first.vendor_name),
            }),
        )
        .await?;
    let delivered = match serde_json::from_value::<NotifyOutcome>(result.clone()) {
        Ok(NotifyOutcome::Sent { .. }) => Ok(()),
        Ok(NotifyOutcome::Failed { reason }) => Err(reason),
        Err(e) => Err(format!("unexpected reply ({e})")),
    };
    Ok((delivered, result))
}
