use depflow_core::{ChannelId, DependencyObject, EventMask, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::properties::{decode_dependent_properties, encode_dependent_properties, PropertyChannels};
use crate::store::DependencyRow;

pub type DependencyId = u64;

/// Merge key of a dependency: one stored row per distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyKey {
    pub source: DependencyObject,
    pub source_property: Option<String>,
    pub dependent: DependencyObject,
}

/// A directed edge: `dependent` derives content from `source`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    id: Option<DependencyId>,
    source: DependencyObject,
    source_property: Option<String>,
    dependent: DependencyObject,
    event_mask: EventMask,
    /// `false` for edges loaded from storage that were not re-confirmed yet.
    existing: bool,
    /// Sorted, duplicate free.
    channel_ids: Vec<ChannelId>,
    channels_changed: bool,
    dependent_properties: PropertyChannels,
    stored_dependent_properties: PropertyChannels,
    merged_deps: Vec<DependencyId>,
    /// Row as last read or written, checked by the store on update.
    loaded: Option<DependencyRow>,
}

impl Dependency {
    /// A transient edge recorded during a traversal or render.
    pub fn new(
        source: DependencyObject,
        source_property: Option<String>,
        dependent: DependencyObject,
        event_mask: EventMask,
    ) -> Self {
        Self {
            id: None,
            source,
            source_property,
            dependent,
            event_mask,
            existing: true,
            channel_ids: Vec::new(),
            channels_changed: false,
            dependent_properties: PropertyChannels::new(),
            stored_dependent_properties: PropertyChannels::new(),
            merged_deps: Vec::new(),
            loaded: None,
        }
    }

    /// Loads a stored row. The edge starts as "old" until it is re-confirmed.
    pub fn from_row(row: &DependencyRow) -> Result<Self> {
        let channel_ids = parse_channel_ids(&row.dependent_channels);
        let stored =
            decode_dependent_properties(row.dependent_properties.as_deref(), &channel_ids)?;
        Ok(Self {
            id: row.id,
            source: row.source,
            source_property: row.source_property.clone(),
            dependent: row.dependent,
            event_mask: row.event_mask,
            existing: false,
            channel_ids,
            channels_changed: false,
            dependent_properties: PropertyChannels::new(),
            stored_dependent_properties: stored,
            merged_deps: Vec::new(),
            loaded: Some(row.clone()),
        })
    }

    /// Persisted form of the live state.
    pub fn to_row(&self) -> Result<DependencyRow> {
        Ok(DependencyRow {
            id: self.id,
            source: self.source,
            source_property: self.source_property.clone(),
            dependent: self.dependent,
            dependent_channels: format_channel_ids(&self.channel_ids),
            event_mask: self.event_mask,
            dependent_properties: encode_dependent_properties(
                &self.dependent_properties,
                &self.channel_ids,
            )?,
        })
    }

    pub fn key(&self) -> DependencyKey {
        DependencyKey {
            source: self.source,
            source_property: self.source_property.clone(),
            dependent: self.dependent,
        }
    }

    /// Total order on (source, source property, dependent).
    pub fn compare(&self, other: &Self) -> Ordering {
        self.source
            .cmp(&other.source)
            .then_with(|| self.source_property.cmp(&other.source_property))
            .then_with(|| self.dependent.cmp(&other.dependent))
    }

    pub fn id(&self) -> Option<DependencyId> {
        self.id
    }

    pub fn source(&self) -> &DependencyObject {
        &self.source
    }

    pub fn source_property(&self) -> Option<&str> {
        self.source_property.as_deref()
    }

    pub fn dependent(&self) -> &DependencyObject {
        &self.dependent
    }

    pub fn event_mask(&self) -> EventMask {
        self.event_mask
    }

    pub fn set_event_mask(&mut self, mask: EventMask) {
        self.event_mask = mask;
    }

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_old(&self) -> bool {
        !self.existing
    }

    /// Re-confirms a loaded edge during a pass.
    pub fn set_existing(&mut self) {
        self.existing = true;
    }

    pub fn is_modified(&self) -> bool {
        self.dependent_properties != self.stored_dependent_properties
            || self.channels_changed
            || !self.merged_deps.is_empty()
    }

    pub fn channel_ids(&self) -> &[ChannelId] {
        &self.channel_ids
    }

    pub fn has_channel(&self, channel: ChannelId) -> bool {
        self.channel_ids.binary_search(&channel).is_ok()
    }

    /// Sorted insert. Returns whether the channel was added.
    pub fn add_channel_id(&mut self, channel: ChannelId) -> bool {
        match self.channel_ids.binary_search(&channel) {
            Ok(_) => false,
            Err(pos) => {
                self.channel_ids.insert(pos, channel);
                self.channels_changed = true;
                true
            }
        }
    }

    /// Retires a channel: drops it from the channel list and from both
    /// property maps. Properties left without channels disappear.
    pub fn remove_channel_id(&mut self, channel: ChannelId) -> bool {
        let removed = match self.channel_ids.binary_search(&channel) {
            Ok(pos) => {
                self.channel_ids.remove(pos);
                self.channels_changed = true;
                true
            }
            Err(_) => false,
        };
        strip_channel(&mut self.dependent_properties, channel);
        strip_channel(&mut self.stored_dependent_properties, channel);
        removed
    }

    pub fn add_dependent_property(&mut self, property: impl Into<String>, channel: ChannelId) {
        self.dependent_properties
            .entry(property.into())
            .or_default()
            .insert(channel);
    }

    pub fn dependent_properties(&self) -> &PropertyChannels {
        &self.dependent_properties
    }

    pub fn stored_dependent_properties(&self) -> &PropertyChannels {
        &self.stored_dependent_properties
    }

    /// Stored properties recorded for `channel`.
    pub fn properties_for_channel(&self, channel: ChannelId) -> Vec<String> {
        self.stored_dependent_properties
            .iter()
            .filter(|(_, channels)| channels.contains(&channel))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Absorbs a duplicate row with the same key; its id is deleted on the next update.
    pub fn merge(&mut self, other: &Dependency) {
        for channel in &other.channel_ids {
            self.add_channel_id(*channel);
        }
        for (name, channels) in &other.stored_dependent_properties {
            self.stored_dependent_properties
                .entry(name.clone())
                .or_default()
                .extend(channels.iter().copied());
        }
        self.event_mask |= other.event_mask;
        if let Some(id) = other.id {
            if Some(id) != self.id && !self.merged_deps.contains(&id) {
                self.merged_deps.push(id);
            }
        }
    }

    pub fn merged_deps(&self) -> &[DependencyId] {
        &self.merged_deps
    }

    pub fn loaded_row(&self) -> Option<&DependencyRow> {
        self.loaded.as_ref()
    }

    /// Copies every stored (property, channel) pair outside `channel` into
    /// the live map, so a partial-channel update keeps other channels intact.
    pub fn preserve_other_dependent_properties(&mut self, channel: ChannelId) {
        for (name, channels) in &self.stored_dependent_properties {
            let others: BTreeSet<ChannelId> =
                channels.iter().copied().filter(|c| *c != channel).collect();
            if !others.is_empty() {
                self.dependent_properties
                    .entry(name.clone())
                    .or_default()
                    .extend(others);
            }
        }
    }

    /// Marks the live state as persisted under `id`.
    pub(crate) fn mark_stored(&mut self, id: DependencyId) -> Result<()> {
        self.id = Some(id);
        self.existing = true;
        self.stored_dependent_properties = self.dependent_properties.clone();
        self.channels_changed = false;
        self.merged_deps.clear();
        self.loaded = Some(self.to_row()?);
        Ok(())
    }

    /// Re-applies this pass's change for `channel` on top of the rows another
    /// writer stored under the same key, merged into `stored`. Channels and
    /// properties of the other channels are taken from `stored`.
    pub(crate) fn rebase_onto(&mut self, stored: Dependency, channel: ChannelId) {
        let mut channel_ids: Vec<ChannelId> = stored
            .channel_ids
            .iter()
            .copied()
            .filter(|c| *c != channel)
            .collect();
        if self.has_channel(channel) {
            channel_ids.push(channel);
            channel_ids.sort_unstable();
        }

        for channels in self.dependent_properties.values_mut() {
            channels.retain(|c| *c == channel);
        }
        self.dependent_properties.retain(|_, channels| !channels.is_empty());
        self.stored_dependent_properties = stored.stored_dependent_properties;
        self.preserve_other_dependent_properties(channel);

        self.channels_changed = channel_ids != stored.channel_ids;
        self.channel_ids = channel_ids;
        self.id = stored.id;
        self.event_mask |= stored.event_mask;
        self.merged_deps = stored.merged_deps;
        self.loaded = stored.loaded;
    }

    /// Forgets the row id after the row vanished, so the edge is inserted again.
    pub(crate) fn detach(&mut self) {
        self.id = None;
        self.loaded = None;
        self.channels_changed = true;
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)?;
        if let Some(property) = &self.source_property {
            write!(f, ".{}", property)?;
        }
        write!(f, " -> {} [{}]", self.dependent, self.event_mask)?;
        if let Some(id) = self.id {
            write!(f, " #{}", id)?;
        }
        Ok(())
    }
}

fn strip_channel(properties: &mut PropertyChannels, channel: ChannelId) {
    properties.retain(|_, channels| {
        channels.remove(&channel);
        !channels.is_empty()
    });
}

pub(crate) fn parse_channel_ids(text: &str) -> Vec<ChannelId> {
    let mut ids: Vec<ChannelId> = text
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

pub(crate) fn format_channel_ids(ids: &[ChannelId]) -> String {
    ids.iter()
        .map(ChannelId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use depflow_core::{EntityRef, ObjectType};

    fn page(id: u32) -> DependencyObject {
        DependencyObject::instance(EntityRef::new(ObjectType::Page, id))
    }

    fn edge() -> Dependency {
        Dependency::new(page(1), Some("content".into()), page(2), EventMask::UPDATE)
    }

    #[test]
    fn new_edge_is_new_and_not_old() {
        let dep = edge();
        assert!(dep.is_new());
        assert!(!dep.is_old());
        assert!(!dep.is_modified());
    }

    #[test]
    fn channel_ids_stay_sorted_and_unique() {
        let mut dep = edge();
        for c in [5, 1, 3, 1, 0, 5] {
            dep.add_channel_id(c);
        }
        assert_eq!(dep.channel_ids(), &[0, 1, 3, 5]);
        assert!(dep.remove_channel_id(3));
        assert!(!dep.remove_channel_id(3));
        assert_eq!(dep.channel_ids(), &[0, 1, 5]);
        assert!(dep.is_modified());
    }

    #[test]
    fn remove_channel_prunes_properties() {
        let mut dep = edge();
        dep.add_channel_id(0);
        dep.add_channel_id(4);
        dep.add_dependent_property("name", 0);
        dep.add_dependent_property("name", 4);
        dep.add_dependent_property("title", 4);

        dep.remove_channel_id(4);
        dep.remove_channel_id(4);
        assert_eq!(dep.dependent_properties().len(), 1);
        assert!(dep
            .dependent_properties()
            .values()
            .all(|channels| !channels.contains(&4)));
    }

    #[test]
    fn merge_unions_channels_and_accumulates_ids() {
        let mut a = Dependency::from_row(&DependencyRow {
            id: Some(1),
            source: page(1),
            source_property: None,
            dependent: page(2),
            dependent_channels: "0".into(),
            event_mask: EventMask::UPDATE,
            dependent_properties: None,
        })
        .unwrap();
        let mut b = a.clone();
        b.id = Some(2);
        b.channel_ids = vec![0, 7];
        let mut c = a.clone();
        c.id = Some(3);
        c.channel_ids = vec![2];

        let mut a2 = a.clone();
        a.merge(&b);
        a.merge(&c);
        a.merge(&c);
        assert_eq!(a.channel_ids(), &[0, 2, 7]);
        assert_eq!(a.merged_deps(), &[2, 3]);

        // channel union does not depend on merge order
        a2.merge(&c);
        a2.merge(&b);
        assert_eq!(a2.channel_ids(), a.channel_ids());
    }

    #[test]
    fn preserve_copies_only_other_channels() {
        let row = DependencyRow {
            id: Some(9),
            source: page(1),
            source_property: None,
            dependent: page(2),
            dependent_channels: "0,3".into(),
            event_mask: EventMask::UPDATE,
            dependent_properties: Some(r#"{"name":[0,3],"title":[3]}"#.into()),
        };
        let mut dep = Dependency::from_row(&row).unwrap();
        assert!(dep.is_old());
        dep.preserve_other_dependent_properties(3);
        let live = dep.dependent_properties();
        assert_eq!(live.len(), 1);
        assert!(live["name"].contains(&0));
        assert!(!live["name"].contains(&3));
    }

    #[test]
    fn row_round_trip_keeps_identity() {
        let mut dep = edge();
        dep.add_channel_id(0);
        dep.add_dependent_property("name", 0);
        let row = dep.to_row().unwrap();
        assert_eq!(row.dependent_channels, "0");
        assert_eq!(row.dependent_properties.as_deref(), Some("name"));

        let loaded = Dependency::from_row(&row).unwrap();
        assert_eq!(loaded.key(), dep.key());
        assert_eq!(loaded.properties_for_channel(0), vec!["name".to_string()]);
    }

    #[test]
    fn channel_list_parsing_is_tolerant() {
        assert_eq!(parse_channel_ids("3, 0,3,,x"), vec![0, 3]);
        assert_eq!(format_channel_ids(&[0, 3]), "0,3");
        assert!(parse_channel_ids("").is_empty());
    }
}
