//! Device manager contract
//!
//! Drivers talk to the kernel device tree through [`DeviceManager`]: they
//! register child nodes carrying typed attributes, read the attributes of the
//! node they were attached to, and publish device paths. Driver entry points
//! follow the [`DriverModule`] shape and track their state with a
//! [`Lifecycle`].

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// Handle of a node in the device tree
pub type NodeId = u32;

/// Longest string attribute value
pub const MAX_ATTR_STRING: usize = 64;

/// Most attributes carried by one node
pub const MAX_ATTRS: usize = 16;

/// Attribute names used by the MMC stack
pub mod attr {
    pub const BUS: &str = "device/bus";
    pub const PRETTY_NAME: &str = "device/pretty name";
    pub const VENDOR: &str = "device/vendor";
    pub const ID: &str = "device/id";
    pub const UNIQUE_ID: &str = "device/unique id";
    pub const MMC_REVISION: &str = "mmc/revision";
    pub const MMC_MONTH: &str = "mmc/month";
    pub const MMC_YEAR: &str = "mmc/year";
    pub const MMC_RCA: &str = "mmc/rca";
    pub const MMC_TYPE: &str = "mmc/type";

    /// Value of [`BUS`] on card nodes
    pub const BUS_MMC: &str = "mmc";
}

/// Typed attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    String(heapless::String<MAX_ATTR_STRING>),
    U8(u8),
    U16(u16),
    U32(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: &'static str,
    pub value: AttrValue,
}

/// Attribute set of a device node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAttributes {
    attrs: heapless::Vec<Attribute, MAX_ATTRS>,
}

impl NodeAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &'static str, value: AttrValue) -> Result<()> {
        self.attrs
            .push(Attribute { name, value })
            .map_err(|_| Error::NoMemory)
    }

    /// Add a string attribute; values longer than [`MAX_ATTR_STRING`] are
    /// truncated at a character boundary
    pub fn push_str(&mut self, name: &'static str, value: &str) -> Result<()> {
        let mut s = heapless::String::new();
        for c in value.chars() {
            if s.push(c).is_err() {
                break;
            }
        }
        self.push(name, AttrValue::String(s))
    }

    pub fn push_u8(&mut self, name: &'static str, value: u8) -> Result<()> {
        self.push(name, AttrValue::U8(value))
    }

    pub fn push_u16(&mut self, name: &'static str, value: u16) -> Result<()> {
        self.push(name, AttrValue::U16(value))
    }

    pub fn push_u32(&mut self, name: &'static str, value: u32) -> Result<()> {
        self.push(name, AttrValue::U32(value))
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            AttrValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_u8(&self, name: &str) -> Option<u8> {
        match self.get(name)? {
            AttrValue::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u16(&self, name: &str) -> Option<u16> {
        match self.get(name)? {
            AttrValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        match self.get(name)? {
            AttrValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }
}

/// Kernel device tree
pub trait DeviceManager: Send + Sync {
    /// Create a child of `parent` carrying `attributes`
    fn register_node(&self, parent: NodeId, attributes: NodeAttributes) -> Result<NodeId>;

    /// Attributes of an existing node
    fn attributes(&self, node: NodeId) -> Option<NodeAttributes>;

    /// Make `node` reachable under `path` (e.g. `disk/mmc/0/raw`)
    fn publish_device(&self, node: NodeId, path: &str) -> Result<()>;
}

/// Driver state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriverState {
    Unloaded = 0,
    Probed = 1,
    Initialized = 2,
    ChildrenRegistered = 3,
    Unloading = 4,
}

impl DriverState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Probed,
            2 => Self::Initialized,
            3 => Self::ChildrenRegistered,
            4 => Self::Unloading,
            _ => Self::Unloaded,
        }
    }

    /// Whether the state machine allows `self -> to`
    fn can_move_to(self, to: DriverState) -> bool {
        use DriverState::*;
        matches!(
            (self, to),
            (Unloaded, Probed)
                | (Unloaded, Initialized)
                | (Probed, Initialized)
                | (Initialized, ChildrenRegistered)
                | (Initialized, Unloading)
                | (ChildrenRegistered, Unloading)
                | (Unloading, Unloaded)
        )
    }
}

/// Atomic holder of a [`DriverState`]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(DriverState::Unloaded as u8),
        }
    }

    pub fn state(&self) -> DriverState {
        DriverState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to`; illegal transitions fail with `ProtocolViolation` and
    /// leave the state untouched
    pub fn advance(&self, to: DriverState) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = DriverState::from_u8(current);
            if !from.can_move_to(to) {
                log::error!("driver: illegal transition {:?} -> {:?}", from, to);
                return Err(Error::ProtocolViolation);
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Fail unless the driver is ready for I/O
    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            DriverState::Initialized | DriverState::ChildrenRegistered => Ok(()),
            DriverState::Unloading => Err(Error::ShuttingDown),
            _ => Err(Error::ProtocolViolation),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver entry points called by the device manager
pub trait DriverModule {
    /// What the driver is attached to (its parent bus)
    type Parent;
    /// Per-node driver context
    type Cookie;

    /// Score in `0.0..=1.0` for how well the driver fits `attributes`;
    /// `0.0` means not supported
    fn supports_device(&self, attributes: &NodeAttributes) -> f32;

    fn init_driver(&self, node: NodeId, parent: Self::Parent) -> Result<Self::Cookie>;

    fn register_child_devices(&self, cookie: &Self::Cookie) -> Result<()>;

    fn uninit_driver(&self, cookie: Self::Cookie);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_typed_lookup() {
        let mut attrs = NodeAttributes::new();
        attrs.push_str(attr::BUS, attr::BUS_MMC).unwrap();
        attrs.push_u16(attr::MMC_RCA, 0x1234).unwrap();
        attrs.push_u8(attr::MMC_TYPE, 2).unwrap();

        assert_eq!(attrs.get_str(attr::BUS), Some("mmc"));
        assert_eq!(attrs.get_u16(attr::MMC_RCA), Some(0x1234));
        // Wrong type is a miss, not a conversion
        assert_eq!(attrs.get_u32(attr::MMC_RCA), None);
        assert_eq!(attrs.get_u8(attr::MMC_YEAR), None);
    }

    #[test]
    fn test_attribute_capacity() {
        let mut attrs = NodeAttributes::new();
        for _ in 0..MAX_ATTRS {
            attrs.push_u8(attr::MMC_MONTH, 1).unwrap();
        }
        assert_eq!(attrs.push_u8(attr::MMC_MONTH, 1), Err(Error::NoMemory));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let lc = Lifecycle::new();
        assert_eq!(lc.ensure_ready(), Err(Error::ProtocolViolation));
        lc.advance(DriverState::Probed).unwrap();
        lc.advance(DriverState::Initialized).unwrap();
        assert_eq!(lc.ensure_ready(), Ok(()));

        // Cannot go back to probing
        assert_eq!(
            lc.advance(DriverState::Probed),
            Err(Error::ProtocolViolation)
        );
        assert_eq!(lc.state(), DriverState::Initialized);

        lc.advance(DriverState::ChildrenRegistered).unwrap();
        lc.advance(DriverState::Unloading).unwrap();
        assert_eq!(lc.ensure_ready(), Err(Error::ShuttingDown));
        lc.advance(DriverState::Unloaded).unwrap();
    }
}
