use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

bitflags! {
    /// Kinds of change carried by a dirt event or reacted to by a dependency edge.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct EventMask: u32 {
        const CREATE = 1;
        const UPDATE = 1 << 1;
        const DELETE = 1 << 2;
        const MOVE = 1 << 3;
        const CHILD = 1 << 4;
        const PARENT = 1 << 5;
        const NOTIFY = 1 << 6;
        const MAINTENANCE_PUBLISH = 1 << 7;
        const MAINTENANCE_DELAY = 1 << 8;
        const MAINTENANCE_REPUBLISH = 1 << 9;
        const MAINTENANCE_MARKPUBLISHED = 1 << 10;
        const MAINTENANCE_MIGRATE = 1 << 11;
        const LOGGING_START = 1 << 12;
        const LOGGING_END = 1 << 13;
        const DATACHECK_CR = 1 << 14;
        const DIRT = 1 << 15;
        const HIDE = 1 << 16;
        const REVEAL = 1 << 17;
        const WASTEBIN = 1 << 18;
        /// Reserved for property-level notifications.
        const PROPERTY = 1 << 19;
        const USER_1 = 1 << 28;
        const USER_2 = 1 << 29;
        const USER_3 = 1 << 30;
        const USER_4 = 1 << 31;

        const MAINTENANCE = Self::MAINTENANCE_PUBLISH.bits()
            | Self::MAINTENANCE_DELAY.bits()
            | Self::MAINTENANCE_REPUBLISH.bits()
            | Self::MAINTENANCE_MARKPUBLISHED.bits()
            | Self::MAINTENANCE_MIGRATE.bits();
        const LOGGING = Self::LOGGING_START.bits() | Self::LOGGING_END.bits();
        /// Events that change the structure around an entity, not only its content.
        const STRUCTURAL = Self::CREATE.bits() | Self::DELETE.bits() | Self::MOVE.bits();
    }
}

impl EventMask {
    /// Guarded bit test: an empty `bit` never matches.
    pub fn is_event(mask: EventMask, bit: EventMask) -> bool {
        !bit.is_empty() && mask.intersects(bit)
    }

    pub fn has(self, bit: EventMask) -> bool {
        Self::is_event(self, bit)
    }
}

// Persisted as the raw bit pattern.
impl Serialize for EventMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for EventMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(EventMask::from_bits_retain)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_event_is_guarded() {
        let mask = EventMask::UPDATE | EventMask::MOVE;
        assert!(EventMask::is_event(mask, EventMask::UPDATE));
        assert!(!EventMask::is_event(mask, EventMask::DELETE));
        assert!(!EventMask::is_event(mask, EventMask::empty()));
    }

    #[test]
    fn display_lists_flag_names() {
        assert_eq!(
            (EventMask::CREATE | EventMask::DELETE).to_string(),
            "CREATE|DELETE"
        );
        assert_eq!(EventMask::empty().to_string(), "NONE");
    }

    #[test]
    fn maintenance_group_covers_all_actions() {
        assert!(EventMask::MAINTENANCE.contains(EventMask::MAINTENANCE_REPUBLISH));
        assert!(!EventMask::MAINTENANCE.intersects(EventMask::UPDATE));
    }
}
