use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::DepflowError;

pub type ObjectId = u32;

/// Channel (node) id. `0` denotes the master scope.
pub type ChannelId = u32;

pub const MASTER_CHANNEL: ChannelId = 0;

/// Entity kinds known to the content platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Node,
    Folder,
    Template,
    Page,
    File,
    Image,
    ContentTag,
    TemplateTag,
    ObjectTag,
    Construct,
    Datasource,
    Form,
    ContentRepository,
}

impl ObjectType {
    pub const ALL: [ObjectType; 13] = [
        ObjectType::Node,
        ObjectType::Folder,
        ObjectType::Template,
        ObjectType::Page,
        ObjectType::File,
        ObjectType::Image,
        ObjectType::ContentTag,
        ObjectType::TemplateTag,
        ObjectType::ObjectTag,
        ObjectType::Construct,
        ObjectType::Datasource,
        ObjectType::Form,
        ObjectType::ContentRepository,
    ];

    /// Numeric type code used in persisted rows.
    pub fn code(self) -> u32 {
        match self {
            ObjectType::Node => 10001,
            ObjectType::Folder => 10002,
            ObjectType::Construct => 10004,
            ObjectType::Template => 10006,
            ObjectType::Page => 10007,
            ObjectType::File => 10008,
            ObjectType::Image => 10011,
            ObjectType::Datasource => 10024,
            ObjectType::Form => 10050,
            ObjectType::ContentTag => 10111,
            ObjectType::TemplateTag => 10112,
            ObjectType::ObjectTag => 10113,
            ObjectType::ContentRepository => 10208,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn class_name(self) -> &'static str {
        match self {
            ObjectType::Node => "Node",
            ObjectType::Folder => "Folder",
            ObjectType::Template => "Template",
            ObjectType::Page => "Page",
            ObjectType::File => "File",
            ObjectType::Image => "ImageFile",
            ObjectType::ContentTag => "ContentTag",
            ObjectType::TemplateTag => "TemplateTag",
            ObjectType::ObjectTag => "ObjectTag",
            ObjectType::Construct => "Construct",
            ObjectType::Datasource => "Datasource",
            ObjectType::Form => "Form",
            ObjectType::ContentRepository => "ContentRepository",
        }
    }

    /// Images are files: dependencies on either collapse onto [`ObjectType::File`].
    pub fn canonical(self) -> Self {
        match self {
            ObjectType::Image => ObjectType::File,
            other => other,
        }
    }

    /// Kinds whose language or channel variants must be invalidated together.
    pub fn has_variants(self) -> bool {
        matches!(
            self,
            ObjectType::Page | ObjectType::Template | ObjectType::File | ObjectType::Image
        )
    }
}

impl Ord for ObjectType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class_name().cmp(other.class_name())
    }
}

impl PartialOrd for ObjectType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

impl FromStr for ObjectType {
    type Err = DepflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u32>() {
            return Self::from_code(code)
                .ok_or_else(|| DepflowError::NotFound(format!("object type code {}", code)));
        }
        let wanted = s.to_ascii_lowercase().replace(['_', '-'], "");
        Self::ALL
            .into_iter()
            .find(|t| {
                t.class_name().to_ascii_lowercase() == wanted
                    || format!("{:?}", t).to_ascii_lowercase() == wanted
            })
            .ok_or_else(|| DepflowError::NotFound(format!("object type {}", s)))
    }
}

/// A (kind, id) reference to a concrete entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: ObjectType,
    pub id: ObjectId,
}

impl EntityRef {
    pub fn new(kind: ObjectType, id: ObjectId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// A resolved entity as seen by the dependency engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityHandle {
    pub kind: ObjectType,
    pub id: ObjectId,
    /// Channel the entity variant lives in (`0` for master objects).
    #[serde(default)]
    pub channel_id: ChannelId,
    /// Node owning the entity, if known.
    #[serde(default)]
    pub node_id: Option<ChannelId>,
    /// Set when the entity no longer exists and only its id is known.
    #[serde(default)]
    pub placeholder: bool,
    /// Structural parents (mother folder, owning page of a tag, ...).
    #[serde(default)]
    pub parents: Vec<EntityRef>,
    /// Sibling grouping variants (language variants, channel variants).
    #[serde(default)]
    pub variants: Vec<EntityRef>,
}

impl EntityHandle {
    pub fn new(kind: ObjectType, id: ObjectId) -> Self {
        Self {
            kind,
            id,
            channel_id: MASTER_CHANNEL,
            node_id: None,
            placeholder: false,
            parents: Vec::new(),
            variants: Vec::new(),
        }
    }

    pub fn placeholder(kind: ObjectType, id: ObjectId) -> Self {
        Self {
            placeholder: true,
            ..Self::new(kind, id)
        }
    }

    pub fn with_channel(mut self, channel_id: ChannelId) -> Self {
        self.channel_id = channel_id;
        self
    }

    pub fn with_node(mut self, node_id: ChannelId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_parent(mut self, parent: EntityRef) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn with_variant(mut self, variant: EntityRef) -> Self {
        self.variants.push(variant);
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id)
    }
}

/// Channel hierarchy information for a node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    /// Master node of this channel; `None` for master nodes.
    pub master: Option<ChannelId>,
}

impl ChannelInfo {
    pub fn is_master(&self) -> bool {
        self.master.is_none()
    }
}

/// Structural metadata for an entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub kind: ObjectType,
    /// Kind contains other entities (folders, nodes).
    pub container: bool,
    /// Kind has language or channel variants.
    pub has_variants: bool,
}
