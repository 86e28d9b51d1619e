//! 工厂数据存储（关系库的内存替身）
//!
//! 维修单、机器与 BOM、备件库存、技术员、供应商、工单与请购单。
//! 非幂等写入（建工单、发料、建请购单）按幂等键记账：重复键直接返回首次结果。

pub mod seed;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::state::PartRequirement;

pub use seed::PlantSeed;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlantError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Insufficient stock for {part_number}: requested {requested}, on hand {on_hand}")]
    InsufficientStock {
        part_number: String,
        requested: u32,
        on_hand: u32,
    },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Seed error: {0}")]
    Seed(String),
}

impl PlantError {
    fn not_found(kind: &'static str, id: &str) -> Self {
        PlantError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// 优先级；声明顺序即排序顺序（critical 最先）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Assigned,
    InProgress,
    WaitingParts,
    Completed,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Assigned => "assigned",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::WaitingParts => "waiting_parts",
            TicketStatus::Completed => "completed",
            TicketStatus::Closed => "closed",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, TicketStatus::Completed | TicketStatus::Closed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Pending,
    Assigned,
    InProgress,
    WaitingParts,
    Completed,
    Rescheduled,
    Cancelled,
}

impl WorkOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderStatus::Pending => "pending",
            WorkOrderStatus::Assigned => "assigned",
            WorkOrderStatus::InProgress => "in_progress",
            WorkOrderStatus::WaitingParts => "waiting_parts",
            WorkOrderStatus::Completed => "completed",
            WorkOrderStatus::Rescheduled => "rescheduled",
            WorkOrderStatus::Cancelled => "cancelled",
        }
    }

    fn is_closed(&self) -> bool {
        matches!(self, WorkOrderStatus::Completed | WorkOrderStatus::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub code: String,
    pub name: String,
    pub location: String,
    pub criticality: Priority,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub part_number: String,
    pub name: String,
    pub category: String,
    pub on_hand: u32,
    pub reorder_point: u32,
    pub bin_location: String,
    pub vendor_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BomLine {
    pub machine_code: String,
    pub part_number: String,
    pub quantity: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Technician {
    pub id: String,
    pub name: String,
    pub specialization: String,
    pub available: bool,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: String,
    pub name: String,
    pub email: String,
    pub priority_rank: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub number: String,
    /// CM（纠正性）/ PM（预防性）
    pub ticket_type: String,
    pub title: String,
    pub machine_code: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub due_date: Option<String>,
    pub specialization: Option<String>,
    pub assigned_technician: Option<String>,
    #[serde(default)]
    pub parts: Vec<PartRequirement>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub number: String,
    pub ticket_number: String,
    pub machine_code: String,
    pub technician_id: String,
    pub description: String,
    pub status: WorkOrderStatus,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub parts: Vec<PartRequirement>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub const REQUISITION_REQUESTED: &str = "requested";
pub const REQUISITION_CANCELLED: &str = "cancelled";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Requisition {
    pub number: String,
    pub work_order: Option<String>,
    pub part_number: String,
    pub quantity: u32,
    pub vendor_id: String,
    pub vendor_name: String,
    pub vendor_email: String,
    pub status: String,
}

/// 发料结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartIssue {
    pub part_number: String,
    pub quantity: u32,
    pub remaining: u32,
    pub work_order: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewWorkOrder {
    pub ticket_number: String,
    pub technician_id: String,
    pub description: String,
    pub parts: Vec<PartRequirement>,
}

#[derive(Clone, Debug)]
enum LedgerEntry {
    WorkOrder(String),
    Issue(PartIssue),
    Requisition(String),
}

#[derive(Debug, Default)]
struct PlantData {
    machines: BTreeMap<String, Machine>,
    parts: BTreeMap<String, Part>,
    bom: Vec<BomLine>,
    technicians: BTreeMap<String, Technician>,
    vendors: BTreeMap<String, Vendor>,
    tickets: BTreeMap<String, Ticket>,
    work_orders: BTreeMap<String, WorkOrder>,
    requisitions: BTreeMap<String, Requisition>,
    /// 幂等键 → 首次结果
    ledger: HashMap<String, LedgerEntry>,
    next_work_order: u32,
    next_requisition: u32,
    /// 单号中的年份段（WO-{year}-0001）
    numbering_year: i32,
}

impl PlantData {
    fn work_order(&self, number: &str) -> Result<&WorkOrder, PlantError> {
        self.work_orders
            .get(number)
            .ok_or_else(|| PlantError::not_found("work order", number))
    }

    fn work_order_mut(&mut self, number: &str) -> Result<&mut WorkOrder, PlantError> {
        self.work_orders
            .get_mut(number)
            .ok_or_else(|| PlantError::not_found("work order", number))
    }

    fn requisition(&self, number: &str) -> Result<Requisition, PlantError> {
        self.requisitions
            .get(number)
            .cloned()
            .ok_or_else(|| PlantError::not_found("requisition", number))
    }
}

/// 工厂数据存储；内部单把读写锁，所有写操作在一次加锁内完成
#[derive(Debug)]
pub struct PlantStore {
    data: RwLock<PlantData>,
}

impl PlantStore {
    pub fn from_seed(seed: PlantSeed) -> Result<Self, PlantError> {
        seed.validate()?;
        let mut data = PlantData {
            next_work_order: 1,
            next_requisition: 1,
            numbering_year: Utc::now().year(),
            ..PlantData::default()
        };
        for m in seed.machines {
            data.machines.insert(m.code.clone(), m);
        }
        for p in seed.parts {
            data.parts.insert(p.part_number.clone(), p);
        }
        data.bom = seed.bom;
        for t in seed.technicians {
            data.technicians.insert(t.id.clone(), t);
        }
        for v in seed.vendors {
            data.vendors.insert(v.id.clone(), v);
        }
        for t in seed.tickets {
            data.tickets.insert(t.number.clone(), t);
        }
        for w in seed.work_orders {
            data.work_orders.insert(w.number.clone(), w);
        }
        Ok(Self {
            data: RwLock::new(data),
        })
    }

    /// 从 TOML 种子文件加载
    pub fn load(path: &Path) -> Result<Self, PlantError> {
        Self::from_seed(PlantSeed::from_file(path)?)
    }

    /// 内置演示数据
    pub fn demo() -> Result<Self, PlantError> {
        Self::from_seed(PlantSeed::demo()?)
    }

    // ---- 维修单 ----

    /// 未关闭的维修单，按优先级、到期日、单号排序
    pub async fn list_open_tickets(&self, priority: Option<Priority>, unassigned_only: bool) -> Vec<Ticket> {
        let data = self.data.read().await;
        let mut tickets: Vec<Ticket> = data
            .tickets
            .values()
            .filter(|t| t.status.is_active())
            .filter(|t| priority.map_or(true, |p| t.priority == p))
            .filter(|t| !unassigned_only || t.status == TicketStatus::Open)
            .cloned()
            .collect();
        tickets.sort_by(|a, b| {
            (a.priority, &a.due_date, &a.number).cmp(&(b.priority, &b.due_date, &b.number))
        });
        tickets
    }

    pub async fn get_ticket(&self, number: &str) -> Result<Ticket, PlantError> {
        self.data
            .read()
            .await
            .tickets
            .get(number)
            .cloned()
            .ok_or_else(|| PlantError::not_found("ticket", number))
    }

    // ---- 机器 ----

    pub async fn get_machine(&self, code: &str) -> Result<Machine, PlantError> {
        self.data
            .read()
            .await
            .machines
            .get(code)
            .cloned()
            .ok_or_else(|| PlantError::not_found("machine", code))
    }

    pub async fn bom(&self, machine_code: &str) -> Result<Vec<BomLine>, PlantError> {
        let data = self.data.read().await;
        if !data.machines.contains_key(machine_code) {
            return Err(PlantError::not_found("machine", machine_code));
        }
        Ok(data
            .bom
            .iter()
            .filter(|l| l.machine_code == machine_code)
            .cloned()
            .collect())
    }

    // ---- 技术员 ----

    pub async fn available_technicians(&self, specialization: Option<&str>) -> Vec<Technician> {
        let data = self.data.read().await;
        data.technicians
            .values()
            .filter(|t| t.available)
            .filter(|t| {
                specialization.map_or(true, |s| t.specialization.to_lowercase().contains(&s.to_lowercase()))
            })
            .cloned()
            .collect()
    }

    // ---- 库存 ----

    pub async fn lookup_part(&self, part_number: &str) -> Result<Part, PlantError> {
        self.data
            .read()
            .await
            .parts
            .get(part_number)
            .cloned()
            .ok_or_else(|| PlantError::not_found("part", part_number))
    }

    /// 库存不高于再订货点的备件
    pub async fn low_stock(&self) -> Vec<Part> {
        self.data
            .read()
            .await
            .parts
            .values()
            .filter(|p| p.on_hand <= p.reorder_point)
            .cloned()
            .collect()
    }

    /// 盘点：把库存设为绝对值（幂等）
    pub async fn set_level(&self, part_number: &str, on_hand: u32) -> Result<Part, PlantError> {
        let mut data = self.data.write().await;
        let part = data
            .parts
            .get_mut(part_number)
            .ok_or_else(|| PlantError::not_found("part", part_number))?;
        part.on_hand = on_hand;
        Ok(part.clone())
    }

    /// 发料（非幂等，按幂等键去重）
    pub async fn issue_part(
        &self,
        part_number: &str,
        quantity: u32,
        work_order: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<PartIssue, PlantError> {
        if quantity == 0 {
            return Err(PlantError::Invalid("quantity must be positive".to_string()));
        }
        let mut data = self.data.write().await;
        if let Some(LedgerEntry::Issue(previous)) = idempotency_key.and_then(|k| data.ledger.get(k)) {
            return Ok(previous.clone());
        }
        let part = data
            .parts
            .get_mut(part_number)
            .ok_or_else(|| PlantError::not_found("part", part_number))?;
        if part.on_hand < quantity {
            return Err(PlantError::InsufficientStock {
                part_number: part_number.to_string(),
                requested: quantity,
                on_hand: part.on_hand,
            });
        }
        part.on_hand -= quantity;
        let issue = PartIssue {
            part_number: part_number.to_string(),
            quantity,
            remaining: part.on_hand,
            work_order: work_order.map(str::to_string),
        };
        if let Some(key) = idempotency_key {
            data.ledger.insert(key.to_string(), LedgerEntry::Issue(issue.clone()));
        }
        Ok(issue)
    }

    // ---- 工单 ----

    pub async fn get_work_order(&self, number: &str) -> Result<WorkOrder, PlantError> {
        self.data.read().await.work_order(number).cloned()
    }

    /// 建工单并把维修单置为 assigned（非幂等，按幂等键去重）
    pub async fn create_work_order(
        &self,
        request: NewWorkOrder,
        idempotency_key: Option<&str>,
    ) -> Result<WorkOrder, PlantError> {
        let mut data = self.data.write().await;
        if let Some(LedgerEntry::WorkOrder(number)) = idempotency_key.and_then(|k| data.ledger.get(k)) {
            let number = number.clone();
            return data.work_order(&number).cloned();
        }
        if !data.technicians.contains_key(&request.technician_id) {
            return Err(PlantError::not_found("technician", &request.technician_id));
        }
        let ticket = data
            .tickets
            .get_mut(&request.ticket_number)
            .ok_or_else(|| PlantError::not_found("ticket", &request.ticket_number))?;
        if !ticket.status.is_active() {
            return Err(PlantError::Invalid(format!(
                "ticket {} is already closed",
                ticket.number
            )));
        }
        ticket.status = TicketStatus::Assigned;
        ticket.assigned_technician = Some(request.technician_id.clone());
        let machine_code = ticket.machine_code.clone();

        let number = format!("WO-{}-{:04}", data.numbering_year, data.next_work_order);
        data.next_work_order += 1;
        let work_order = WorkOrder {
            number: number.clone(),
            ticket_number: request.ticket_number,
            machine_code,
            technician_id: request.technician_id,
            description: request.description,
            status: WorkOrderStatus::Assigned,
            notes: Vec::new(),
            parts: request.parts,
            updated_at: Some(Utc::now()),
        };
        data.work_orders.insert(number.clone(), work_order.clone());
        if let Some(key) = idempotency_key {
            data.ledger.insert(key.to_string(), LedgerEntry::WorkOrder(number));
        }
        Ok(work_order)
    }

    /// 更新工单状态（幂等：重复设置同一状态与备注结果相同），并同步维修单状态
    pub async fn update_work_order_status(
        &self,
        number: &str,
        status: WorkOrderStatus,
        note: Option<&str>,
    ) -> Result<WorkOrder, PlantError> {
        let mut data = self.data.write().await;
        let work_order = data.work_order_mut(number)?;
        if work_order.status.is_closed() && work_order.status != status {
            return Err(PlantError::Invalid(format!(
                "work order {number} is already {}",
                work_order.status.as_str()
            )));
        }
        work_order.status = status;
        if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
            if !work_order.notes.iter().any(|n| n == note) {
                work_order.notes.push(note.to_string());
            }
        }
        work_order.updated_at = Some(Utc::now());
        let work_order = work_order.clone();

        if let Some(ticket) = data.tickets.get_mut(&work_order.ticket_number) {
            ticket.status = match status {
                WorkOrderStatus::Completed => TicketStatus::Completed,
                WorkOrderStatus::WaitingParts => TicketStatus::WaitingParts,
                WorkOrderStatus::InProgress => TicketStatus::InProgress,
                _ => ticket.status,
            };
        }
        Ok(work_order)
    }

    /// 追加技术员备注（幂等：相同备注只记一次）
    pub async fn add_work_order_note(&self, number: &str, note: &str) -> Result<WorkOrder, PlantError> {
        let note = note.trim();
        if note.is_empty() {
            return Err(PlantError::Invalid("note must not be empty".to_string()));
        }
        let mut data = self.data.write().await;
        let work_order = data.work_order_mut(number)?;
        if !work_order.notes.iter().any(|n| n == note) {
            work_order.notes.push(note.to_string());
            work_order.updated_at = Some(Utc::now());
        }
        Ok(work_order.clone())
    }

    // ---- 采购 ----

    /// 供应商，按 priority_rank 升序
    pub async fn vendors(&self) -> Vec<Vendor> {
        let data = self.data.read().await;
        let mut vendors: Vec<Vendor> = data.vendors.values().cloned().collect();
        vendors.sort_by(|a, b| a.priority_rank.cmp(&b.priority_rank).then_with(|| a.id.cmp(&b.id)));
        vendors
    }

    /// 建请购单（非幂等，按幂等键去重）
    ///
    /// 供应商：显式指定者，否则零件的指定供应商，否则优先级最高者。
    pub async fn create_requisition(
        &self,
        part_number: &str,
        quantity: u32,
        work_order: Option<&str>,
        vendor_id: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<Requisition, PlantError> {
        if quantity == 0 {
            return Err(PlantError::Invalid("quantity must be positive".to_string()));
        }
        let mut data = self.data.write().await;
        if let Some(LedgerEntry::Requisition(number)) = idempotency_key.and_then(|k| data.ledger.get(k)) {
            let number = number.clone();
            return data.requisition(&number);
        }
        let part = data
            .parts
            .get(part_number)
            .ok_or_else(|| PlantError::not_found("part", part_number))?;
        let vendor = match vendor_id {
            Some(id) => data
                .vendors
                .get(id)
                .ok_or_else(|| PlantError::not_found("vendor", id))?,
            None => part
                .vendor_id
                .as_ref()
                .and_then(|id| data.vendors.get(id))
                .or_else(|| data.vendors.values().min_by_key(|v| v.priority_rank))
                .ok_or_else(|| PlantError::Invalid("no vendor available".to_string()))?,
        }
        .clone();

        let number = format!("PR-{}-{:04}", data.numbering_year, data.next_requisition);
        data.next_requisition += 1;
        let requisition = Requisition {
            number: number.clone(),
            work_order: work_order.map(str::to_string),
            part_number: part_number.to_string(),
            quantity,
            vendor_id: vendor.id,
            vendor_name: vendor.name,
            vendor_email: vendor.email,
            status: REQUISITION_REQUESTED.to_string(),
        };
        data.requisitions.insert(number.clone(), requisition.clone());
        if let Some(key) = idempotency_key {
            data.ledger.insert(key.to_string(), LedgerEntry::Requisition(number));
        }
        Ok(requisition)
    }

    /// 取消请购单（幂等：重复取消结果相同）
    pub async fn cancel_requisition(&self, number: &str) -> Result<Requisition, PlantError> {
        let mut data = self.data.write().await;
        let requisition = data
            .requisitions
            .get_mut(number)
            .ok_or_else(|| PlantError::not_found("requisition", number))?;
        requisition.status = REQUISITION_CANCELLED.to_string();
        Ok(requisition.clone())
    }

    pub async fn requisitions(&self) -> Vec<Requisition> {
        self.data.read().await.requisitions.values().cloned().collect()
    }

    pub async fn work_orders(&self) -> Vec<WorkOrder> {
        self.data.read().await.work_orders.values().cloned().collect()
    }
}
