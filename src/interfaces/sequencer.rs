//! Command classification interface.

use std::fmt;
use std::sync::Arc;

use crate::model::{CommandKind, DataDirection, SenseReason};

use super::StorageBackend;

/// Device properties a sequencer needs to decode a CDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub block_size: u32,
    pub capacity_sectors: u64,
}

/// A decoded CDB.
#[derive(Clone)]
pub struct Classification {
    pub lba: u64,
    /// Length in logical blocks. Zero for control commands that address no
    /// block range.
    pub sectors: u64,
    pub data_length: usize,
    pub direction: DataDirection,
    pub kind: CommandKind,
    /// Executor that answers the command in place of the device backend.
    pub emulation: Option<Arc<dyn StorageBackend>>,
}

impl Classification {
    pub fn data(lba: u64, sectors: u64, block_size: u32, direction: DataDirection) -> Self {
        Self {
            lba,
            sectors,
            data_length: (sectors * u64::from(block_size)) as usize,
            direction,
            kind: CommandKind::Data,
            emulation: None,
        }
    }

    pub fn control(data_length: usize, direction: DataDirection) -> Self {
        Self {
            lba: 0,
            sectors: 0,
            data_length,
            direction,
            kind: CommandKind::Control,
            emulation: None,
        }
    }

    /// A command that addresses a block range but moves no data, such as
    /// a cache flush. It runs as one task covering the whole range.
    pub fn ranged(lba: u64, sectors: u64) -> Self {
        Self {
            lba,
            sectors,
            ..Self::control(0, DataDirection::None)
        }
    }

    pub fn emulated_by(mut self, executor: Arc<dyn StorageBackend>) -> Self {
        self.emulation = Some(executor);
        self
    }
}

impl fmt::Debug for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classification")
            .field("lba", &self.lba)
            .field("sectors", &self.sectors)
            .field("data_length", &self.data_length)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("emulated", &self.emulation.is_some())
            .finish()
    }
}

/// Decodes CDBs. The task attribute is carried by the request itself.
pub trait CommandSequencer: Send + Sync {
    fn classify(&self, cdb: &[u8], geometry: &DeviceGeometry)
        -> Result<Classification, SenseReason>;
}
