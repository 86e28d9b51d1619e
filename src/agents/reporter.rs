//! Reporter：维修单与低库存汇总邮件

use serde_json::json;

use crate::capability::NotifyOutcome;
use crate::core::error::OrchestratorError;
use crate::core::state::StateDelta;
use crate::plant::{Part, Ticket};

use super::{bullet_list, describe_part, describe_ticket, AgentContext, AgentStep};

fn report_body(tickets: &[Ticket], low_stock: &[Part]) -> String {
    let tickets_section = if tickets.is_empty() {
        "No open tickets.".to_string()
    } else {
        bullet_list(tickets, describe_ticket)
    };
    let stock_section = if low_stock.is_empty() {
        "All parts above reorder point.".to_string()
    } else {
        bullet_list(low_stock, describe_part)
    };
    format!(
        "Open tickets ({}):\n{tickets_section}\n\nLow stock ({}):\n{stock_section}\n",
        tickets.len(),
        low_stock.len()
    )
}

pub(super) async fn run(ctx: &AgentContext<'_>) -> Result<AgentStep, OrchestratorError> {
    let tickets: Vec<Ticket> = ctx.scope.invoke_as("tickets.list_open", json!({})).await?;
    let low_stock: Vec<Part> = ctx.scope.invoke_as("inventory.low_stock", json!({})).await?;

    let recipient = ctx.settings.report_recipient.clone();
    let result = ctx
        .scope
        .invoke(
            "notify.send_email",
            json!({
                "recipient": recipient,
                "subject": format!("Maintenance status report {}", ctx.now.format("%Y-%m-%d")),
                "body": report_body(&tickets, &low_stock),
            }),
        )
        .await?;

    let finding = match serde_json::from_value::<NotifyOutcome>(result.clone()) {
        Ok(NotifyOutcome::Sent { message_id }) => format!(
            "Status report ({} open tickets, {} low-stock parts) emailed to {recipient} ({message_id})",
            tickets.len(),
            low_stock.len()
        ),
        Ok(NotifyOutcome::Failed { reason }) => format!("Status report to {recipient} failed: {reason}"),
        Err(e) => format!("Status report to {recipient}: unexpected reply ({e})"),
    };
    Ok(AgentStep::new(StateDelta::new().intent("summarize").finding(finding.clone()))
        .tool("notify.send_email", result)
        .say(ctx.agent(), finding))
}
