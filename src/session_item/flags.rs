use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Lifecycle flags of a session item.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ItemFlags(u32);

impl ItemFlags {
    pub const NONE: Self = Self(0);
    pub const CONFIGURED: Self = Self(1 << 0);
    pub const ACTIVATING: Self = Self(1 << 1);
    pub const ACTIVE: Self = Self(1 << 2);
    pub const EXPORTING: Self = Self(1 << 3);
    pub const EXPORTED: Self = Self(1 << 4);

    pub const ACTIVATION_MASK: Self = Self(Self::ACTIVATING.0 | Self::ACTIVE.0);
    pub const EXPORT_MASK: Self = Self(Self::EXPORTING.0 | Self::EXPORTED.0);

    /// All bits of `other` are set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ItemFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ItemFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ItemFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for ItemFlags {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for ItemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(ItemFlags, &str)] = &[
            (ItemFlags::CONFIGURED, "CONFIGURED"),
            (ItemFlags::ACTIVATING, "ACTIVATING"),
            (ItemFlags::ACTIVE, "ACTIVE"),
            (ItemFlags::EXPORTING, "EXPORTING"),
            (ItemFlags::EXPORTED, "EXPORTED"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_ops() {
        let mut flags = ItemFlags::CONFIGURED | ItemFlags::ACTIVATING;
        assert!(flags.intersects(ItemFlags::ACTIVATION_MASK));
        assert!(!flags.contains(ItemFlags::ACTIVATION_MASK));
        flags.remove(ItemFlags::ACTIVATING);
        flags.insert(ItemFlags::ACTIVE);
        assert!(flags.contains(ItemFlags::CONFIGURED | ItemFlags::ACTIVE));
        assert_eq!(format!("{:?}", flags), "CONFIGURED|ACTIVE");
        assert_eq!(format!("{:?}", ItemFlags::NONE), "(none)");
        assert_eq!(flags & !ItemFlags::ACTIVE, ItemFlags::CONFIGURED);
    }
}
