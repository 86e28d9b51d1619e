//! 工厂种子数据（TOML）

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{BomLine, Machine, Part, PlantError, Technician, Ticket, Vendor, WorkOrder};

const DEMO_SEED: &str = include_str!("../../config/plant.toml");

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantSeed {
    pub machines: Vec<Machine>,
    pub parts: Vec<Part>,
    pub bom: Vec<BomLine>,
    pub technicians: Vec<Technician>,
    pub vendors: Vec<Vendor>,
    pub tickets: Vec<Ticket>,
    pub work_orders: Vec<WorkOrder>,
}

impl PlantSeed {
    pub fn from_toml(raw: &str) -> Result<Self, PlantError> {
        toml::from_str(raw).map_err(|e| PlantError::Seed(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, PlantError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PlantError::Seed(format!("{}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn demo() -> Result<Self, PlantError> {
        Self::from_toml(DEMO_SEED)
    }

    /// 引用完整性：BOM、维修单、工单引用的机器、零件与技术员必须存在
    pub fn validate(&self) -> Result<(), PlantError> {
        let machines: HashSet<&str> = self.machines.iter().map(|m| m.code.as_str()).collect();
        let parts: HashSet<&str> = self.parts.iter().map(|p| p.part_number.as_str()).collect();
        let technicians: HashSet<&str> = self.technicians.iter().map(|t| t.id.as_str()).collect();
        let tickets: HashSet<&str> = self.tickets.iter().map(|t| t.number.as_str()).collect();
        let vendors: HashSet<&str> = self.vendors.iter().map(|v| v.id.as_str()).collect();

        let missing = |kind: &str, id: &str, from: &str| {
            PlantError::Seed(format!("{from} references unknown {kind} '{id}'"))
        };

        for line in &self.bom {
            if !machines.contains(line.machine_code.as_str()) {
                return Err(missing("machine", &line.machine_code, "bom"));
            }
            if !parts.contains(line.part_number.as_str()) {
                return Err(missing("part", &line.part_number, "bom"));
            }
        }
        for part in &self.parts {
            if let Some(vendor) = part.vendor_id.as_deref().filter(|v| !vendors.contains(v)) {
                return Err(missing("vendor", vendor, &part.part_number));
            }
        }
        for ticket in &self.tickets {
            if !machines.contains(ticket.machine_code.as_str()) {
                return Err(missing("machine", &ticket.machine_code, &ticket.number));
            }
            if let Some(p) = ticket.parts.iter().find(|p| !parts.contains(p.part_number.as_str())) {
                return Err(missing("part", &p.part_number, &ticket.number));
            }
        }
        for wo in &self.work_orders {
            if !tickets.contains(wo.ticket_number.as_str()) {
                return Err(missing("ticket", &wo.ticket_number, &wo.number));
            }
            if !technicians.contains(wo.technician_id.as_str()) {
                return Err(missing("technician", &wo.technician_id, &wo.number));
            }
        }
        Ok(())
    }
}
