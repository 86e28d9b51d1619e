//! 工厂数据能力：维修单、机器、技术员、库存、工单、采购
//!
//! 每个能力是 PlantStore 上的一个薄封装；参数结构体同时生成 schema。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::notify::{Notifier, SendEmail};
use super::{CapabilityError, CapabilityRegistry, SideEffect, TypedCapability};
use crate::core::state::PartRequirement;
use crate::plant::{NewWorkOrder, PlantError, PlantStore, Priority, WorkOrderStatus};

impl From<PlantError> for CapabilityError {
    fn from(e: PlantError) -> Self {
        match e {
            PlantError::NotFound { .. } => CapabilityError::NotFound(e.to_string()),
            other => CapabilityError::Failed(other.to_string()),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, CapabilityError> {
    serde_json::to_value(value).map_err(|e| CapabilityError::Failed(e.to_string()))
}

/// 注册全部工厂数据能力
pub fn register_plant_capabilities(registry: &mut CapabilityRegistry, store: Arc<PlantStore>) {
    registry.register_typed(ListOpenTickets(store.clone()));
    registry.register_typed(GetTicket(store.clone()));
    registry.register_typed(GetMachine(store.clone()));
    registry.register_typed(MachineBom(store.clone()));
    registry.register_typed(AvailableTechnicians(store.clone()));
    registry.register_typed(LookupPart(store.clone()));
    registry.register_typed(LowStock(store.clone()));
    registry.register_typed(SetLevel(store.clone()));
    registry.register_typed(IssuePart(store.clone()));
    registry.register_typed(GetWorkOrder(store.clone()));
    registry.register_typed(CreateWorkOrder(store.clone()));
    registry.register_typed(UpdateWorkOrderStatus(store.clone()));
    registry.register_typed(AddWorkOrderNotes(store.clone()));
    registry.register_typed(ListVendors(store.clone()));
    registry.register_typed(CreateRequisition(store.clone()));
    registry.register_typed(CancelRequisition(store));
}

/// 工厂数据能力 + 邮件通知
pub fn standard_registry(store: Arc<PlantStore>, notifier: Arc<dyn Notifier>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    register_plant_capabilities(&mut registry, store);
    registry.register_typed(SendEmail::new(notifier));
    registry
}

// ---- tickets ----

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ListOpenTicketsArgs {
    /// 只返回该优先级
    pub priority: Option<Priority>,
    /// 只返回尚未派工的维修单
    pub unassigned_only: bool,
}

pub struct ListOpenTickets(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for ListOpenTickets {
    type Args = ListOpenTicketsArgs;
    const NAME: &'static str = "tickets.list_open";
    const DESCRIPTION: &'static str = "List open maintenance tickets ordered by priority and due date";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, args: ListOpenTicketsArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.list_open_tickets(args.priority, args.unassigned_only).await)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TicketArgs {
    /// 维修单号，如 CM-2026-0001
    pub ticket_number: String,
}

pub struct GetTicket(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for GetTicket {
    type Args = TicketArgs;
    const NAME: &'static str = "tickets.get";
    const DESCRIPTION: &'static str = "Get one maintenance ticket by number";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, args: TicketArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.get_ticket(&args.ticket_number).await?)
    }
}

// ---- machines ----

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MachineArgs {
    /// 机器编码，如 PS-01
    pub machine_code: String,
}

pub struct GetMachine(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for GetMachine {
    type Args = MachineArgs;
    const NAME: &'static str = "machines.get";
    const DESCRIPTION: &'static str = "Get machine details by code";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, args: MachineArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.get_machine(&args.machine_code).await?)
    }
}

pub struct MachineBom(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for MachineBom {
    type Args = MachineArgs;
    const NAME: &'static str = "machines.bom";
    const DESCRIPTION: &'static str = "Bill of materials (spare parts and quantities) for a machine";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, args: MachineArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.bom(&args.machine_code).await?)
    }
}

// ---- technicians ----

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct AvailableTechniciansArgs {
    /// 专业方向（可选，模糊匹配）
    pub specialization: Option<String>,
}

pub struct AvailableTechnicians(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for AvailableTechnicians {
    type Args = AvailableTechniciansArgs;
    const NAME: &'static str = "technicians.available";
    const DESCRIPTION: &'static str = "List available technicians, optionally filtered by specialization";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, args: AvailableTechniciansArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.available_technicians(args.specialization.as_deref()).await)
    }
}

// ---- inventory ----

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PartArgs {
    /// 零件号，如 BRG-6205-2RS
    pub part_number: String,
}

pub struct LookupPart(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for LookupPart {
    type Args = PartArgs;
    const NAME: &'static str = "inventory.lookup_part";
    const DESCRIPTION: &'static str = "Stock level, bin location and vendor of one spare part";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, args: PartArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.lookup_part(&args.part_number).await?)
    }
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

pub struct LowStock(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for LowStock {
    type Args = NoArgs;
    const NAME: &'static str = "inventory.low_stock";
    const DESCRIPTION: &'static str = "Spare parts at or below their reorder point";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, _args: NoArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.low_stock().await)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SetLevelArgs {
    pub part_number: String,
    /// 盘点后的绝对库存
    pub on_hand: u32,
}

pub struct SetLevel(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for SetLevel {
    type Args = SetLevelArgs;
    const NAME: &'static str = "inventory.set_level";
    const DESCRIPTION: &'static str = "Set the counted stock level of a part";
    const SIDE_EFFECT: SideEffect = SideEffect::IdempotentWrite;

    async fn run(&self, args: SetLevelArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.set_level(&args.part_number, args.on_hand).await?)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IssuePartArgs {
    pub part_number: String,
    pub quantity: u32,
    /// 领料工单号
    #[serde(default)]
    pub work_order_id: Option<String>,
}

pub struct IssuePart(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for IssuePart {
    type Args = IssuePartArgs;
    const NAME: &'static str = "inventory.issue_part";
    const DESCRIPTION: &'static str = "Issue parts from stock to a work order";
    const SIDE_EFFECT: SideEffect = SideEffect::NonIdempotentWrite;

    async fn run(&self, args: IssuePartArgs, key: Option<&str>) -> Result<Value, CapabilityError> {
        let issue = self
            .0
            .issue_part(&args.part_number, args.quantity, args.work_order_id.as_deref(), key)
            .await?;
        to_value(&issue)
    }
}

// ---- work orders ----

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkOrderArgs {
    /// 工单号，如 WO-PS-015
    pub work_order_id: String,
}

pub struct GetWorkOrder(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for GetWorkOrder {
    type Args = WorkOrderArgs;
    const NAME: &'static str = "work_orders.get";
    const DESCRIPTION: &'static str = "Get one work order by number";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, args: WorkOrderArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.get_work_order(&args.work_order_id).await?)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateWorkOrderArgs {
    pub ticket_number: String,
    pub technician_id: String,
    pub description: String,
    #[serde(default)]
    pub parts: Vec<PartRequirement>,
}

pub struct CreateWorkOrder(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for CreateWorkOrder {
    type Args = CreateWorkOrderArgs;
    const NAME: &'static str = "work_orders.create";
    const DESCRIPTION: &'static str = "Create a work order for a ticket and assign a technician";
    const SIDE_EFFECT: SideEffect = SideEffect::NonIdempotentWrite;

    async fn run(&self, args: CreateWorkOrderArgs, key: Option<&str>) -> Result<Value, CapabilityError> {
        let request = NewWorkOrder {
            ticket_number: args.ticket_number,
            technician_id: args.technician_id,
            description: args.description,
            parts: args.parts,
        };
        to_value(&self.0.create_work_order(request, key).await?)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusArgs {
    pub work_order_id: String,
    pub status: WorkOrderStatus,
    #[serde(default)]
    pub note: Option<String>,
}

pub struct UpdateWorkOrderStatus(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for UpdateWorkOrderStatus {
    type Args = UpdateStatusArgs;
    const NAME: &'static str = "work_orders.update_status";
    const DESCRIPTION: &'static str = "Set a work order status (completed, waiting_parts, rescheduled, ...)";
    const SIDE_EFFECT: SideEffect = SideEffect::IdempotentWrite;

    async fn run(&self, args: UpdateStatusArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        let wo = self
            .0
            .update_work_order_status(&args.work_order_id, args.status, args.note.as_deref())
            .await?;
        to_value(&wo)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AddNotesArgs {
    pub work_order_id: String,
    pub notes: String,
}

pub struct AddWorkOrderNotes(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for AddWorkOrderNotes {
    type Args = AddNotesArgs;
    const NAME: &'static str = "work_orders.add_notes";
    const DESCRIPTION: &'static str = "Append technician notes to a work order";
    const SIDE_EFFECT: SideEffect = SideEffect::IdempotentWrite;

    async fn run(&self, args: AddNotesArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.add_work_order_note(&args.work_order_id, &args.notes).await?)
    }
}

// ---- procurement ----

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateRequisitionArgs {
    pub part_number: String,
    pub quantity: u32,
    #[serde(default)]
    pub work_order_id: Option<String>,
    /// 缺省时用零件的指定供应商
    #[serde(default)]
    pub vendor_id: Option<String>,
}

pub struct CreateRequisition(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for CreateRequisition {
    type Args = CreateRequisitionArgs;
    const NAME: &'static str = "procurement.create_requisition";
    const DESCRIPTION: &'static str =
        "Raise a purchase requisition for a part with the given vendor, or the part's preferred vendor";
    const SIDE_EFFECT: SideEffect = SideEffect::NonIdempotentWrite;

    async fn run(&self, args: CreateRequisitionArgs, key: Option<&str>) -> Result<Value, CapabilityError> {
        let requisition = self
            .0
            .create_requisition(
                &args.part_number,
                args.quantity,
                args.work_order_id.as_deref(),
                args.vendor_id.as_deref(),
                key,
            )
            .await?;
        to_value(&requisition)
    }
}

pub struct ListVendors(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for ListVendors {
    type Args = NoArgs;
    const NAME: &'static str = "procurement.vendors";
    const DESCRIPTION: &'static str = "Vendors in priority order";
    const SIDE_EFFECT: SideEffect = SideEffect::ReadOnly;

    async fn run(&self, _args: NoArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.vendors().await)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CancelRequisitionArgs {
    /// 请购单号
    pub requisition_id: String,
}

pub struct CancelRequisition(pub Arc<PlantStore>);

#[async_trait]
impl TypedCapability for CancelRequisition {
    type Args = CancelRequisitionArgs;
    const NAME: &'static str = "procurement.cancel_requisition";
    const DESCRIPTION: &'static str = "Cancel a purchase requisition the vendor could not take";
    const SIDE_EFFECT: SideEffect = SideEffect::IdempotentWrite;

    async fn run(&self, args: CancelRequisitionArgs, _key: Option<&str>) -> Result<Value, CapabilityError> {
        to_value(&self.0.cancel_requisition(&args.requisition_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::LogNotifier;

    fn registry() -> CapabilityRegistry {
        let store = Arc::new(PlantStore::demo().unwrap());
        standard_registry(store, Arc::new(LogNotifier::new()))
    }

    #[test]
    fn test_all_capabilities_registered() {
        let names = registry().names();
        assert_eq!(names.len(), 17);
        for name in ["tickets.list_open", "inventory.issue_part", "notify.send_email"] {
            assert!(names.iter().any(|n| n == name), "{name}");
        }
    }

    #[tokio::test]
    async fn test_lookup_and_not_found() {
        let registry = registry();
        let lookup = registry.get("inventory.lookup_part").unwrap();
        let part = lookup
            .invoke(serde_json::json!({"part_number": "BRG-6205-2RS"}), None)
            .await
            .unwrap();
        assert_eq!(part["on_hand"], 15);
        let err = lookup
            .invoke(serde_json::json!({"part_number": "XX-1"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_status_enum_is_validated() {
        let registry = registry();
        let update = registry.get("work_orders.update_status").unwrap();
        let err = update
            .invoke(serde_json::json!({"work_order_id": "WO-PS-015", "status": "exploded"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidArguments(_)));
        let ok = update
            .invoke(serde_json::json!({"work_order_id": "WO-PS-015", "status": "completed"}), None)
            .await
            .unwrap();
        assert_eq!(ok["status"], "completed");
    }

    #[tokio::test]
    async fn test_list_open_accepts_null_args() {
        let registry = registry();
        let list = registry.get("tickets.list_open").unwrap();
        let out = list.invoke(Value::Null, None).await.unwrap();
        assert_eq!(out.as_array().unwrap().len(), 4);
    }
}
