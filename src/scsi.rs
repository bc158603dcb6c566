//! SCSI protocol constants: operation codes, status bytes and sense data.
//!
//! Values are open newtypes over `u8` so that codes this crate does not name
//! still round-trip through the engine untouched.

use std::fmt;

macro_rules! open_code {
    (
        $(#[$meta:meta])*
        pub struct $name:ident { $($variant:ident = $value:expr,)* }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u8);

        #[allow(missing_docs)]
        impl $name {
            $(pub const $variant: $name = $name($value);)*
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)*
                    Self(other) => write!(f, "{}({:#04x})", stringify!($name), other),
                }
            }
        }
    };
}

open_code! {
    /// SCSI operation code, the first byte of every CDB.
    pub struct ScsiOp {
        TEST_UNIT_READY = 0x00,
        READ_6 = 0x08,
        WRITE_6 = 0x0a,
        INQUIRY = 0x12,
        READ_CAPACITY = 0x25,
        READ_10 = 0x28,
        WRITE_10 = 0x2a,
        VERIFY_10 = 0x2f,
        SYNCHRONIZE_CACHE = 0x35,
        READ_16 = 0x88,
        WRITE_16 = 0x8a,
        VERIFY_16 = 0x8f,
        SYNCHRONIZE_CACHE_16 = 0x91,
        READ_12 = 0xa8,
        WRITE_12 = 0xaa,
    }
}

open_code! {
    /// Status byte returned to the initiator.
    pub struct ScsiStatus {
        GOOD = 0x00,
        CHECK_CONDITION = 0x02,
        BUSY = 0x08,
        TASK_SET_FULL = 0x28,
        TASK_ABORTED = 0x40,
    }
}

open_code! {
    pub struct SenseKey {
        NO_SENSE = 0x00,
        NOT_READY = 0x02,
        MEDIUM_ERROR = 0x03,
        HARDWARE_ERROR = 0x04,
        ILLEGAL_REQUEST = 0x05,
        UNIT_ATTENTION = 0x06,
        DATA_PROTECT = 0x07,
        ABORTED_COMMAND = 0x0b,
    }
}

open_code! {
    pub struct AdditionalSenseCode {
        NO_SENSE = 0x00,
        LUN_COMMUNICATION = 0x08,
        ILLEGAL_COMMAND = 0x20,
        ILLEGAL_BLOCK = 0x21,
        INVALID_CDB = 0x24,
        INVALID_LUN = 0x25,
        WRITE_PROTECT = 0x27,
        PARAMETERS_CHANGED = 0x2a,
        INTERNAL_TARGET_FAILURE = 0x44,
    }
}

pub const SCSI_SENSEQ_CAPACITY_DATA_CHANGED: u8 = 0x09;
pub const SCSI_SENSEQ_SPACE_ALLOCATION_FAILED_WRITE_PROTECT: u8 = 0x07;

/// Length of fixed-format sense data as built by [`SenseData::to_bytes`].
pub const FIXED_SENSE_LEN: usize = 18;

const FIXED_CURRENT: u8 = 0x70;

/// Fixed-format sense data (response code 70h).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: SenseKey,
    pub additional_sense_code: AdditionalSenseCode,
    pub additional_sense_code_qualifier: u8,
}

impl SenseData {
    pub const fn new(
        sense_key: SenseKey,
        additional_sense_code: AdditionalSenseCode,
        additional_sense_code_qualifier: u8,
    ) -> Self {
        Self {
            sense_key,
            additional_sense_code,
            additional_sense_code_qualifier,
        }
    }

    /// Encode as the 18-byte fixed format.
    pub fn to_bytes(&self) -> [u8; FIXED_SENSE_LEN] {
        let mut buf = [0u8; FIXED_SENSE_LEN];
        buf[0] = FIXED_CURRENT;
        buf[2] = self.sense_key.0 & 0x0f;
        buf[7] = (FIXED_SENSE_LEN - 8) as u8;
        buf[12] = self.additional_sense_code.0;
        buf[13] = self.additional_sense_code_qualifier;
        buf
    }

    /// Decode fixed-format sense data. Returns `None` for descriptor format
    /// or truncated input.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 14 || buf[0] & 0x7e != FIXED_CURRENT {
            return None;
        }
        Some(Self::new(
            SenseKey(buf[2] & 0x0f),
            AdditionalSenseCode(buf[12]),
            buf[13],
        ))
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:02x}h/{:02x}h",
            self.sense_key, self.additional_sense_code.0, self.additional_sense_code_qualifier
        )
    }
}
