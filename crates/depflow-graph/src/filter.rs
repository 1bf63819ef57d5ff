use depflow_core::{ChannelId, DependencyObject, EntityRef, EventMask, ObjectType};

use crate::dependency::Dependency;
use crate::store::{ElementMatch, ObjectMatch, PropertyFilter, RowFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSelector {
    Instance(EntityRef),
    Class(ObjectType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSelector {
    Instance(EntityRef),
    Class(ObjectType),
    None,
}

/// Source-side lookup of dependency edges.
///
/// Covers the six query shapes {source instance, source class} x {element
/// instance, element class, no element}, combined with a property filter,
/// an event mask bit test and an optional channel post-filter. A query whose
/// mask carries DELETE matches on object identity only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyQuery {
    pub source: SourceSelector,
    pub element: ElementSelector,
    pub properties: PropertyFilter,
    pub event_mask: EventMask,
    pub channel: Option<ChannelId>,
}

impl DependencyQuery {
    pub fn instance(source: EntityRef) -> Self {
        Self::with_source(SourceSelector::Instance(source))
    }

    pub fn class(kind: ObjectType) -> Self {
        Self::with_source(SourceSelector::Class(kind))
    }

    fn with_source(source: SourceSelector) -> Self {
        Self {
            source,
            element: ElementSelector::None,
            properties: PropertyFilter::Any,
            event_mask: EventMask::empty(),
            channel: None,
        }
    }

    /// Derives the query shape from a dependency object. `None` for objects
    /// without a class.
    pub fn for_object(object: &DependencyObject) -> Option<Self> {
        let kind = object.object_type()?;
        let mut query = match object.object_id() {
            Some(id) => Self::instance(EntityRef::new(kind, id)),
            None => Self::class(kind),
        };
        query.element = match (object.element_type(), object.element_id()) {
            (Some(t), Some(id)) => ElementSelector::Instance(EntityRef::new(t, id)),
            (Some(t), None) => ElementSelector::Class(t),
            _ => ElementSelector::None,
        };
        Some(query)
    }

    pub fn element(mut self, element: EntityRef) -> Self {
        self.element = ElementSelector::Instance(element);
        self
    }

    pub fn element_class(mut self, kind: ObjectType) -> Self {
        self.element = ElementSelector::Class(kind);
        self
    }

    pub fn properties(mut self, properties: PropertyFilter) -> Self {
        self.properties = properties;
        self
    }

    pub fn event_mask(mut self, mask: EventMask) -> Self {
        self.event_mask = mask;
        self
    }

    pub fn channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn row_filter(&self) -> RowFilter {
        let identity_only = self.event_mask.has(EventMask::DELETE);
        RowFilter {
            source: match self.source {
                SourceSelector::Instance(e) => ObjectMatch::Instance(e.kind, e.id),
                SourceSelector::Class(kind) => ObjectMatch::Class(kind),
            },
            source_element: if identity_only {
                ElementMatch::Any
            } else {
                match self.element {
                    ElementSelector::Instance(e) => ElementMatch::Instance(e.kind, e.id),
                    ElementSelector::Class(kind) => ElementMatch::ClassOrNull(kind),
                    ElementSelector::None => ElementMatch::Absent,
                }
            },
            source_property: if identity_only {
                PropertyFilter::Any
            } else {
                self.properties.clone()
            },
            dependent: ObjectMatch::Any,
            event_mask: (!self.event_mask.is_empty()).then_some(self.event_mask),
        }
    }
}

/// Keeps the edges recorded for `channel` (`0` = master).
pub fn filter_for_channel(dependencies: &mut Vec<Dependency>, channel: ChannelId) {
    dependencies.retain(|dep| dep.has_channel(channel));
}

/// Keeps the edges that recorded `property` on their dependent.
pub fn filter_for_property(dependencies: &mut Vec<Dependency>, property: &str) {
    dependencies.retain(|dep| {
        dep.stored_dependent_properties().contains_key(property)
            || dep.dependent_properties().contains_key(property)
    });
}
