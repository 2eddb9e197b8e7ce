//! Mesh address classes.

use serde::{Deserialize, Serialize};

/// The unassigned address
pub const UNASSIGNED_ADDRESS: u16 = 0x0000;
/// All-proxies fixed group address
pub const ALL_PROXIES: u16 = 0xFFFC;
/// All-friends fixed group address
pub const ALL_FRIENDS: u16 = 0xFFFD;
/// All-relays fixed group address
pub const ALL_RELAYS: u16 = 0xFFFE;
/// All-nodes fixed group address
pub const ALL_NODES: u16 = 0xFFFF;

/// Classification of a 16-bit mesh address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeshAddress {
    /// 0x0000
    Unassigned,
    /// 0x0001..=0x7FFF, a single element
    Unicast(u16),
    /// 0x8000..=0xBFFF, hash of a label UUID
    Virtual(u16),
    /// 0xC000..=0xFFFF
    Group(u16),
}

impl MeshAddress {
    /// The raw 16-bit value
    pub fn value(self) -> u16 {
        match self {
            MeshAddress::Unassigned => UNASSIGNED_ADDRESS,
            MeshAddress::Unicast(a) | MeshAddress::Virtual(a) | MeshAddress::Group(a) => a,
        }
    }

    /// Whether this is a unicast address
    pub fn is_unicast(self) -> bool {
        matches!(self, MeshAddress::Unicast(_))
    }

    /// Whether the address reaches more than one element
    pub fn is_multicast(self) -> bool {
        matches!(self, MeshAddress::Virtual(_) | MeshAddress::Group(_))
    }
}

impl From<u16> for MeshAddress {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => MeshAddress::Unassigned,
            0x0001..=0x7FFF => MeshAddress::Unicast(value),
            0x8000..=0xBFFF => MeshAddress::Virtual(value),
            _ => MeshAddress::Group(value),
        }
    }
}

impl std::fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.value())
    }
}

/// Shorthand for `MeshAddress::from(addr).is_unicast()`
pub fn is_unicast(addr: u16) -> bool {
    MeshAddress::from(addr).is_unicast()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_classes() {
        assert_eq!(MeshAddress::from(0x0000), MeshAddress::Unassigned);
        assert_eq!(MeshAddress::from(0x0001), MeshAddress::Unicast(0x0001));
        assert_eq!(MeshAddress::from(0x7FFF), MeshAddress::Unicast(0x7FFF));
        assert_eq!(MeshAddress::from(0x8000), MeshAddress::Virtual(0x8000));
        assert_eq!(MeshAddress::from(0xC000), MeshAddress::Group(0xC000));
        assert_eq!(MeshAddress::from(ALL_NODES), MeshAddress::Group(0xFFFF));
    }

    #[test]
    fn test_unicast_and_multicast() {
        assert!(is_unicast(0x1201));
        assert!(!is_unicast(ALL_FRIENDS));
        assert!(MeshAddress::from(0x9123).is_multicast());
        assert!(!MeshAddress::Unassigned.is_multicast());
        assert_eq!(MeshAddress::from(0x1201).to_string(), "0x1201");
    }
}
