use super::ExecMask;
use serde::{Deserialize, Serialize};

/// Address space targeted by an instrumented memory instruction.
///
/// Numbering follows the AMDGPU address space encoding used by the instrumentation.
#[derive(
    strum::FromRepr,
    strum::Display,
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum MemorySpace {
    Flat = 0,
    Global = 1,
    Gds = 2,
    /// Local data share (LDS)
    Shared = 3,
    Constant = 4,
    Scratch = 5,
    Undefined = 0xf,
}

/// Direction of a memory access.
#[derive(
    strum::FromRepr,
    strum::Display,
    Debug,
    Default,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Direction {
    #[default]
    #[strum(serialize = "unspecified memory operation")]
    Undefined = 0,
    #[strum(serialize = "read")]
    Read = 1,
    #[strum(serialize = "write")]
    Write = 2,
    #[strum(serialize = "read/write")]
    ReadWrite = 3,
}

/// Message kind tag for address messages.
pub const ADDRESS_MESSAGE: u32 = 1;

/// Size of a single address data item in bytes.
pub const ADDRESS_ITEM_SIZE: u32 = std::mem::size_of::<u64>() as u32;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("message of user type {user_type:#x} is not an address message")]
    NotAnAddress { user_type: u32 },

    #[error("address messages carry 8-byte data items, got {item_size}")]
    ItemSize { item_size: u32 },

    #[error("{num_active} active lanes but {num_items} addresses")]
    LaneCountMismatch { num_active: usize, num_items: usize },

    #[error("payload of {num_bytes} bytes is not a multiple of the data item size")]
    TruncatedPayload { num_bytes: usize },
}

/// Per-wavefront header written by the device-side instrumentation.
#[derive(Debug, Default, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveHeader {
    pub exec: u64,
    pub user_type: u32,
    /// Packed access metadata.
    ///
    /// bits 0..2: direction, bits 2..6: memory space, bits 6..22: bytes per lane.
    pub user_data: u32,
    pub data_item_size: u32,
    pub arch: u8,
    pub dwarf_fname_hash: u64,
    pub dwarf_line: u32,
    pub dwarf_column: u32,
}

impl WaveHeader {
    #[must_use]
    pub fn direction(&self) -> Direction {
        // all four 2-bit values are valid
        Direction::from_repr((self.user_data & 0b11) as u8).unwrap_or_default()
    }

    /// Memory space, or `None` for tags that do not name a known space.
    #[must_use]
    pub fn memory_space(&self) -> Option<MemorySpace> {
        MemorySpace::from_repr(((self.user_data >> 2) & 0xf) as u8)
    }

    #[must_use]
    pub fn access_size(&self) -> u16 {
        ((self.user_data >> 6) & 0xffff) as u16
    }
}

/// An undecoded message as delivered by the host-side channel.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub header: WaveHeader,
    pub data: Vec<u8>,
}

impl RawMessage {
    /// Decode an address message.
    ///
    /// Data items are native-endian 64-bit addresses, one per active lane.
    pub fn decode(&self) -> Result<AccessMessage, Error> {
        let header = &self.header;
        if header.user_type != ADDRESS_MESSAGE {
            return Err(Error::NotAnAddress {
                user_type: header.user_type,
            });
        }
        if header.data_item_size != ADDRESS_ITEM_SIZE {
            return Err(Error::ItemSize {
                item_size: header.data_item_size,
            });
        }
        let item_size = ADDRESS_ITEM_SIZE as usize;
        if self.data.len() % item_size != 0 {
            return Err(Error::TruncatedPayload {
                num_bytes: self.data.len(),
            });
        }
        let addresses = self
            .data
            .chunks_exact(item_size)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                u64::from_ne_bytes(bytes)
            })
            .collect();

        let mut message = AccessMessage::new(
            header.memory_space(),
            header.direction(),
            header.access_size(),
            ExecMask::from(header.exec),
            addresses,
        )?;
        message.file_name_hash = header.dwarf_fname_hash;
        message.line = header.dwarf_line;
        message.column = header.dwarf_column;
        message.arch = header.arch;
        Ok(message)
    }
}

/// Address accessed by a single lane.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaneAccess {
    pub lane: usize,
    pub address: u64,
}

/// A decoded, wavefront-wide memory access event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMessage {
    /// `None` if the instrumentation tagged the access with an unknown space.
    pub memory_space: Option<MemorySpace>,
    pub direction: Direction,
    /// Bytes accessed per lane, as seen by the instrumentation.
    pub access_size: u16,
    pub exec: ExecMask,
    /// Active lanes and their addresses, by ascending lane id.
    pub lanes: Vec<LaneAccess>,
    pub file_name_hash: u64,
    pub line: u32,
    pub column: u32,
    pub arch: u8,
}

impl AccessMessage {
    /// Pair each active lane of `exec` with its address.
    pub fn new(
        memory_space: Option<MemorySpace>,
        direction: Direction,
        access_size: u16,
        exec: ExecMask,
        addresses: Vec<u64>,
    ) -> Result<Self, Error> {
        let num_active = exec.num_active();
        if num_active != addresses.len() {
            return Err(Error::LaneCountMismatch {
                num_active,
                num_items: addresses.len(),
            });
        }
        let lanes = exec
            .active_lanes()
            .zip(addresses)
            .map(|(lane, address)| LaneAccess { lane, address })
            .collect();
        Ok(Self {
            memory_space,
            direction,
            access_size,
            exec,
            lanes,
            file_name_hash: 0,
            line: 0,
            column: 0,
            arch: 0,
        })
    }

    #[must_use]
    pub fn with_location(mut self, file_name_hash: u64, line: u32, column: u32) -> Self {
        self.file_name_hash = file_name_hash;
        self.line = line;
        self.column = column;
        self
    }

    #[must_use]
    pub fn with_arch(mut self, arch: u8) -> Self {
        self.arch = arch;
        self
    }

    #[must_use]
    pub fn num_active(&self) -> usize {
        self.lanes.len()
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.lanes.iter().map(|access| access.address)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AccessMessage, Direction, Error, MemorySpace, RawMessage, WaveHeader, ADDRESS_MESSAGE,
    };
    use crate::ExecMask;
    use similar_asserts as diff;

    fn user_data(direction: u32, space: u32, size: u32) -> u32 {
        direction | (space << 2) | (size << 6)
    }

    #[test]
    fn test_decode_header_fields() {
        let header = WaveHeader {
            user_data: user_data(2, 3, 16),
            ..WaveHeader::default()
        };
        diff::assert_eq!(have: header.direction(), want: Direction::Write);
        diff::assert_eq!(have: header.memory_space(), want: Some(MemorySpace::Shared));
        diff::assert_eq!(have: header.access_size(), want: 16);

        let header = WaveHeader {
            user_data: user_data(0, 9, 4),
            ..WaveHeader::default()
        };
        diff::assert_eq!(have: header.memory_space(), want: None);
    }

    #[test]
    fn test_decode_raw_message() {
        let addresses = [0x1000_u64, 0x1004, 0x1010];
        let data = addresses.iter().flat_map(|a| a.to_ne_bytes()).collect();
        let raw = RawMessage {
            header: WaveHeader {
                exec: 0b1011,
                user_type: ADDRESS_MESSAGE,
                user_data: user_data(1, 1, 4),
                data_item_size: 8,
                arch: 3,
                dwarf_fname_hash: 0xabc,
                dwarf_line: 12,
                dwarf_column: 7,
            },
            data,
        };
        let message = raw.decode().unwrap();
        let lanes: Vec<_> = message.lanes.iter().map(|l| (l.lane, l.address)).collect();
        diff::assert_eq!(have: lanes, want: vec![(0, 0x1000), (1, 0x1004), (3, 0x1010)]);
        diff::assert_eq!(have: message.memory_space, want: Some(MemorySpace::Global));
        diff::assert_eq!(have: message.direction, want: Direction::Read);
        diff::assert_eq!(have: (message.line, message.column, message.arch), want: (12, 7, 3));
    }

    #[test]
    fn test_decode_rejects_non_address_messages() {
        let raw = RawMessage {
            header: WaveHeader {
                user_type: 2,
                ..WaveHeader::default()
            },
            data: vec![],
        };
        diff::assert_eq!(have: raw.decode(), want: Err(Error::NotAnAddress { user_type: 2 }));
    }

    #[test]
    fn test_lane_count_mismatch() {
        let err = AccessMessage::new(
            Some(MemorySpace::Global),
            Direction::Read,
            4,
            ExecMask::from(0b111_u64),
            vec![0, 4],
        )
        .unwrap_err();
        diff::assert_eq!(have: err, want: Error::LaneCountMismatch { num_active: 3, num_items: 2 });
    }

    #[test]
    fn test_direction_names() {
        diff::assert_eq!(have: Direction::Undefined.to_string(), want: "unspecified memory operation");
        diff::assert_eq!(have: Direction::ReadWrite.to_string(), want: "read/write");
    }
}
