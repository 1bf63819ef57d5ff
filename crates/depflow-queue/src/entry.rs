//! Queue entries: one durable unit of pending work per mutation.
//!
//! An entry is written once and afterwards only ever marked as failed. What
//! it asks for is derived from its content by [`QueueEntry::classify`].

use chrono::Utc;
use depflow_core::{
    DepflowError, EntityRef, EventMask, MaintenanceAction, MaintenanceKind, ObjectId, ObjectType,
    Result,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type QueueEntryId = u64;

/// Property marking a publish-run entry.
pub const PUBLISH_MARKER: &str = "__publish__";
/// Property marking an entry that holds back consumption until released.
pub const BLOCKER_MARKER: &str = "__blocker__";

const NODE_PREFIX: &str = "node=";
const START_PREFIX: &str = "start=";
const END_PREFIX: &str = "end=";
const CR_PREFIX: &str = "cr=";
const REPAIR_FLAG: &str = "repair";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    #[default]
    Off,
    Intermediate,
    Final,
}

impl SimulationMode {
    pub fn code(self) -> u8 {
        match self {
            SimulationMode::Off => 0,
            SimulationMode::Intermediate => 1,
            SimulationMode::Final => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SimulationMode::Off),
            1 => Some(SimulationMode::Intermediate),
            2 => Some(SimulationMode::Final),
            _ => None,
        }
    }

    pub fn is_simulation(self) -> bool {
        self != SimulationMode::Off
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Option<QueueEntryId>,
    /// Unix seconds.
    pub timestamp: i64,
    pub obj_type: Option<ObjectType>,
    pub obj_id: Option<ObjectId>,
    pub event_mask: Option<EventMask>,
    pub properties: Vec<String>,
    pub simulation: SimulationMode,
    /// Session that caused the entry.
    pub sid: Option<String>,
    pub failed: bool,
    pub fail_reason: Option<String>,
}

/// Persisted form: `-1` for missing object type/id, comma joined properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRow {
    pub id: Option<QueueEntryId>,
    pub timestamp: i64,
    pub obj_type: i64,
    pub obj_id: i64,
    pub eventmask: Option<u32>,
    pub property: Option<String>,
    pub simulation: u8,
    pub sid: Option<String>,
    pub failed: bool,
    pub failreason: Option<String>,
}

/// What an entry asks the consumer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntryKind {
    PublishMarker,
    BlockerMarker,
    Logging { start: bool },
    Maintenance(MaintenanceAction),
    ContentRepositoryCheck { cr_id: ObjectId, repair: bool },
    HideReveal { hide: bool },
    Dirt,
}

impl QueueEntry {
    fn blank() -> Self {
        Self {
            id: None,
            timestamp: Utc::now().timestamp(),
            obj_type: None,
            obj_id: None,
            event_mask: None,
            properties: Vec::new(),
            simulation: SimulationMode::Off,
            sid: None,
            failed: false,
            fail_reason: None,
        }
    }

    /// A dirt event for a mutated entity.
    pub fn event(
        entity: EntityRef,
        mask: EventMask,
        properties: Vec<String>,
        sid: Option<String>,
    ) -> Self {
        Self {
            obj_type: Some(entity.kind),
            obj_id: Some(entity.id),
            event_mask: Some(mask),
            properties,
            sid,
            ..Self::blank()
        }
    }

    pub fn publish_marker() -> Self {
        Self {
            properties: vec![PUBLISH_MARKER.to_string()],
            ..Self::blank()
        }
    }

    pub fn blocker_marker() -> Self {
        Self {
            properties: vec![BLOCKER_MARKER.to_string()],
            ..Self::blank()
        }
    }

    pub fn logging(start: bool) -> Self {
        Self {
            event_mask: Some(if start {
                EventMask::LOGGING_START
            } else {
                EventMask::LOGGING_END
            }),
            ..Self::blank()
        }
    }

    pub fn maintenance(action: &MaintenanceAction) -> Self {
        let mut properties = Vec::new();
        if let Some(node) = action.node {
            properties.push(format!("{}{}", NODE_PREFIX, node));
        }
        if let Some(start) = action.start {
            properties.push(format!("{}{}", START_PREFIX, start));
        }
        if let Some(end) = action.end {
            properties.push(format!("{}{}", END_PREFIX, end));
        }
        Self {
            obj_type: action.object_type,
            event_mask: Some(action.kind.mask()),
            properties,
            ..Self::blank()
        }
    }

    pub fn content_repository_check(cr_id: ObjectId, repair: bool) -> Self {
        let mut properties = vec![format!("{}{}", CR_PREFIX, cr_id)];
        if repair {
            properties.push(REPAIR_FLAG.to_string());
        }
        Self {
            obj_type: Some(ObjectType::ContentRepository),
            obj_id: Some(cr_id),
            event_mask: Some(EventMask::DATACHECK_CR),
            properties,
            ..Self::blank()
        }
    }

    pub fn with_simulation(mut self, simulation: SimulationMode) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn mask(&self) -> EventMask {
        self.event_mask.unwrap_or_default()
    }

    pub fn entity(&self) -> Option<EntityRef> {
        Some(EntityRef::new(self.obj_type?, self.obj_id?))
    }

    fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p == name)
    }

    fn prefixed(&self, prefix: &str) -> Option<&str> {
        self.properties.iter().find_map(|p| p.strip_prefix(prefix))
    }

    fn parse_prefixed<T: std::str::FromStr>(&self, prefix: &str) -> Result<Option<T>> {
        self.prefixed(prefix)
            .map(|raw| {
                raw.trim().parse().map_err(|_| {
                    DepflowError::Encoding(format!("invalid value {:?} for {}", raw, prefix))
                })
            })
            .transpose()
    }

    pub fn is_blocker(&self) -> bool {
        matches!(self.classify(), Ok(QueueEntryKind::BlockerMarker))
    }

    pub fn classify(&self) -> Result<QueueEntryKind> {
        if self.has_property(PUBLISH_MARKER) {
            return Ok(QueueEntryKind::PublishMarker);
        }
        if self.has_property(BLOCKER_MARKER) {
            return Ok(QueueEntryKind::BlockerMarker);
        }

        let mask = self.mask();
        if mask.has(EventMask::LOGGING) {
            return Ok(QueueEntryKind::Logging {
                start: mask.has(EventMask::LOGGING_START),
            });
        }
        if let Some(kind) = MaintenanceKind::from_mask(mask) {
            return Ok(QueueEntryKind::Maintenance(MaintenanceAction {
                kind,
                object_type: self.obj_type,
                node: self.parse_prefixed(NODE_PREFIX)?,
                start: self.parse_prefixed(START_PREFIX)?,
                end: self.parse_prefixed(END_PREFIX)?,
            }));
        }
        if mask.has(EventMask::DATACHECK_CR) {
            let cr_id = match self.parse_prefixed(CR_PREFIX)? {
                Some(id) => id,
                None => self.obj_id.ok_or_else(|| {
                    DepflowError::InvalidOperation(
                        "content repository check without repository id".to_string(),
                    )
                })?,
            };
            return Ok(QueueEntryKind::ContentRepositoryCheck {
                cr_id,
                repair: self.has_property(REPAIR_FLAG),
            });
        }
        if mask.has(EventMask::HIDE | EventMask::REVEAL) {
            return Ok(QueueEntryKind::HideReveal {
                hide: mask.has(EventMask::HIDE),
            });
        }
        Ok(QueueEntryKind::Dirt)
    }

    pub fn to_row(&self) -> QueueRow {
        QueueRow {
            id: self.id,
            timestamp: self.timestamp,
            obj_type: self.obj_type.map_or(-1, |t| i64::from(t.code())),
            obj_id: self.obj_id.map_or(-1, i64::from),
            eventmask: self.event_mask.map(|m| m.bits()),
            property: (!self.properties.is_empty()).then(|| self.properties.join(",")),
            simulation: self.simulation.code(),
            sid: self.sid.clone(),
            failed: self.failed,
            failreason: self.fail_reason.clone(),
        }
    }

    pub fn from_row(row: &QueueRow) -> Result<Self> {
        let obj_type = match row.obj_type {
            code if code < 0 => None,
            code => Some(
                u32::try_from(code)
                    .ok()
                    .and_then(ObjectType::from_code)
                    .ok_or_else(|| DepflowError::Encoding(format!("unknown type code {}", code)))?,
            ),
        };
        let obj_id = match row.obj_id {
            id if id < 0 => None,
            id => Some(
                ObjectId::try_from(id)
                    .map_err(|_| DepflowError::Encoding(format!("object id {} out of range", id)))?,
            ),
        };
        let simulation = SimulationMode::from_code(row.simulation).ok_or_else(|| {
            DepflowError::Encoding(format!("unknown simulation mode {}", row.simulation))
        })?;
        Ok(Self {
            id: row.id,
            timestamp: row.timestamp,
            obj_type,
            obj_id,
            event_mask: row.eventmask.map(EventMask::from_bits_retain),
            properties: row
                .property
                .as_deref()
                .map(|p| {
                    p.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            simulation,
            sid: row.sid.clone(),
            failed: row.failed,
            fail_reason: row.failreason.clone(),
        })
    }
}

impl fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "#{}", id)?,
            None => f.write_str("#new")?,
        }
        if let Some(entity) = self.entity() {
            write!(f, " {}", entity)?;
        }
        if let Some(mask) = self.event_mask {
            write!(f, " [{}]", mask)?;
        }
        if !self.properties.is_empty() {
            write!(f, " {}", self.properties.join(","))?;
        }
        Ok(())
    }
}
