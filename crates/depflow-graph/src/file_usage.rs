use depflow_core::{ChannelId, ObjectId, ObjectType};
use std::collections::{BTreeSet, HashMap};

use crate::dependency::parse_channel_ids;
use crate::store::DependencyRow;

/// File id -> channels in which a page or folder depends on the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileUsageMap {
    usage: HashMap<ObjectId, BTreeSet<ChannelId>>,
}

impl FileUsageMap {
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a DependencyRow>) -> Self {
        let mut usage: HashMap<ObjectId, BTreeSet<ChannelId>> = HashMap::new();
        for row in rows {
            let from_listing = matches!(
                row.dependent.object_type(),
                Some(ObjectType::Page | ObjectType::Folder)
            );
            if !from_listing || row.source.object_type() != Some(ObjectType::File) {
                continue;
            }
            if let Some(file_id) = row.source.object_id() {
                usage
                    .entry(file_id)
                    .or_default()
                    .extend(parse_channel_ids(&row.dependent_channels));
            }
        }
        Self { usage }
    }

    /// Usage in the master (`0`) only counts master usage; usage in a channel
    /// also counts usage inherited from the master.
    pub fn is_file_used(&self, file_id: ObjectId, channel: ChannelId) -> bool {
        self.usage.get(&file_id).is_some_and(|channels| {
            channels.contains(&channel) || (channel != 0 && channels.contains(&0))
        })
    }

    pub fn channels(&self, file_id: ObjectId) -> Option<&BTreeSet<ChannelId>> {
        self.usage.get(&file_id)
    }

    pub fn len(&self) -> usize {
        self.usage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }
}
