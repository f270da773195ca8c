use core::fmt::Display;
use serde::{Deserialize, Serialize};

/// The kind of device a kernel runs on.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
pub enum DeviceKind {
    /// The host CPU.
    #[serde(rename = "host")]
    Host,
    /// An accelerator addressed by its physical index.
    #[serde(rename = "accelerator")]
    Accelerator,
}

/// The device id.
#[derive(
    new, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize,
)]
pub struct DeviceId {
    /// The kind of device.
    pub kind: DeviceKind,
    /// The device number within its kind.
    pub index: u32,
}

impl DeviceId {
    /// The host device.
    pub const fn host() -> Self {
        Self {
            kind: DeviceKind::Host,
            index: 0,
        }
    }

    /// The accelerator with the given physical index.
    pub const fn accelerator(index: u32) -> Self {
        Self {
            kind: DeviceKind::Accelerator,
            index,
        }
    }

    /// The physical accelerator index, if this is an accelerator.
    ///
    /// Workers are pinned per accelerator, host work isn't bound to any index.
    pub fn accelerator_index(&self) -> Option<u32> {
        match self.kind {
            DeviceKind::Host => None,
            DeviceKind::Accelerator => Some(self.index),
        }
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::host()
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind {
            DeviceKind::Host => f.write_str("host"),
            DeviceKind::Accelerator => write!(f, "accelerator:{}", self.index),
        }
    }
}
