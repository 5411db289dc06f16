//! Byte layouts of granule descriptors and the chunk kinds replicated by HA.
//!
//! In-memory structures are little-endian and addressed by handle; the
//! accessors here only ever see a bounds-checked slice.
//!
//! ```text
//! Descriptor (40 bytes)
//! ┌──────────┬──────────┬──────────┬──────────┬────────────┬──────────┬──────────┬──────┬─────┐
//! │ total:4  │ granule:4│ attr:8   │ state:8  │ next:8     │ dataLen:4│ dtype:2  │pool:1│ pad │
//! └──────────┴──────────┴──────────┴──────────┴────────────┴──────────┴──────────┴──────┴─────┘
//! ```

/// Size of a granule descriptor.
pub const DESCRIPTOR_SIZE: usize = 40;

/// Data types stored in descriptors.
pub mod data_type {
    pub const FREE_GRANULE: u16 = 0;
    /// Allocated but not yet tagged with its final type.
    pub const NEWLY_HATCHED: u16 = 1;
    pub const REFERENCES: u16 = 2;
    pub const REF_STATES: u16 = 3;
    pub const STATES: u16 = 4;
    /// Records owning references and states begin with a split item.
    pub const OWNER: u16 = 0x10;
    /// First engine-defined record type.
    pub const USER_BASE: u16 = 0x20;

    pub fn is_owner(dt: u16) -> bool {
        dt == OWNER
    }
}

fn get_u16(buf: &[u8], pos: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[pos..pos + 2]);
    u16::from_le_bytes(b)
}

fn get_u32(buf: &[u8], pos: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], pos: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(b)
}

fn set_u16(buf: &mut [u8], pos: usize, v: u16) {
    buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
}

fn set_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
}

fn set_u64(buf: &mut [u8], pos: usize, v: u64) {
    buf[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
}

/// Decoded granule descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Bytes of the whole record across all granules.
    pub total_length: u32,
    pub granule_index: u32,
    pub attribute: u64,
    pub state: u64,
    /// Raw handle of the next granule of a multi-granule record.
    pub next_handle: u64,
    /// Bytes used in this granule after the descriptor.
    pub data_length: u32,
    pub data_type: u16,
    pub pool_id: u8,
}

impl Descriptor {
    pub const ATTRIBUTE_OFFSET: usize = 8;
    pub const STATE_OFFSET: usize = 16;
    pub const NEXT_OFFSET: usize = 24;
    pub const DATA_TYPE_OFFSET: usize = 36;

    pub fn read(buf: &[u8]) -> Self {
        Self {
            total_length: get_u32(buf, 0),
            granule_index: get_u32(buf, 4),
            attribute: get_u64(buf, 8),
            state: get_u64(buf, 16),
            next_handle: get_u64(buf, 24),
            data_length: get_u32(buf, 32),
            data_type: get_u16(buf, 36),
            pool_id: buf[38],
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        set_u32(buf, 0, self.total_length);
        set_u32(buf, 4, self.granule_index);
        set_u64(buf, 8, self.attribute);
        set_u64(buf, 16, self.state);
        set_u64(buf, 24, self.next_handle);
        set_u32(buf, 32, self.data_length);
        set_u16(buf, 36, self.data_type);
        buf[38] = self.pool_id;
        buf[39] = 0;
    }

    pub fn data_type_of(buf: &[u8]) -> u16 {
        get_u16(buf, Self::DATA_TYPE_OFFSET)
    }

    pub fn set_data_type(buf: &mut [u8], dt: u16) {
        set_u16(buf, Self::DATA_TYPE_OFFSET, dt);
    }

    pub fn set_attribute(buf: &mut [u8], v: u64) {
        set_u64(buf, Self::ATTRIBUTE_OFFSET, v);
    }

    pub fn set_state(buf: &mut [u8], v: u64) {
        set_u64(buf, Self::STATE_OFFSET, v);
    }
}

/// Leading structure of owner records. Offsets are relative to the record data.
pub mod split_item {
    pub const VERSION: usize = 0;
    pub const LARGE_DATA: usize = 8;
    pub const DATA_LENGTH: usize = 16;
    pub const MIN_ACTIVE_OID: usize = 24;
    pub const REF_CONTEXT: usize = 32;
    pub const STATE_CONTEXT: usize = 40;
    pub const SIZE: usize = 48;

    pub fn version(data: &[u8]) -> u32 {
        super::get_u32(data, VERSION)
    }

    pub fn set_version(data: &mut [u8], v: u32) {
        super::set_u32(data, VERSION, v)
    }

    pub fn large_data(data: &[u8]) -> u64 {
        super::get_u64(data, LARGE_DATA)
    }

    pub fn set_large_data(data: &mut [u8], h: u64) {
        super::set_u64(data, LARGE_DATA, h)
    }

    pub fn min_active_oid(data: &[u8]) -> u64 {
        super::get_u64(data, MIN_ACTIVE_OID)
    }
}

/// Header of a reference chunk, stored after the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefChunkHeader {
    pub owner: u64,
    pub base_oid: u64,
    pub owner_version: u32,
    pub count: u32,
}

impl RefChunkHeader {
    pub const SIZE: usize = 24;
    /// Size of one reference slot.
    pub const SLOT_SIZE: usize = 16;

    pub fn read(buf: &[u8]) -> Self {
        Self {
            owner: get_u64(buf, 0),
            base_oid: get_u64(buf, 8),
            owner_version: get_u32(buf, 16),
            count: get_u32(buf, 20),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        set_u64(buf, 0, self.owner);
        set_u64(buf, 8, self.base_oid);
        set_u32(buf, 16, self.owner_version);
        set_u32(buf, 20, self.count);
    }
}

/// One reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reference {
    pub ref_handle: u64,
    pub value: u32,
    pub state: u8,
    pub flag: u8,
}

impl Reference {
    pub fn read(buf: &[u8]) -> Self {
        Self {
            ref_handle: get_u64(buf, 0),
            value: get_u32(buf, 8),
            state: buf[12],
            flag: buf[13],
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        set_u64(buf, 0, self.ref_handle);
        set_u32(buf, 8, self.value);
        buf[12] = self.state;
        buf[13] = self.flag;
        buf[14] = 0;
        buf[15] = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.ref_handle == 0
    }
}

/// Header of a reference-state chunk, followed by one state byte per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefStateChunkHeader {
    pub owner_version: u32,
    pub owner: u64,
    pub base_oid: u64,
    pub count: u32,
}

impl RefStateChunkHeader {
    pub const SIZE: usize = 28;
    /// State byte of a deleted reference.
    pub const DELETED: u8 = 0xfe;
    /// State byte of a slot never written since the chunk was initialized.
    pub const NOT_VALID: u8 = 0xff;

    pub fn read(buf: &[u8]) -> Self {
        Self {
            owner_version: get_u32(buf, 4),
            owner: get_u64(buf, 8),
            base_oid: get_u64(buf, 16),
            count: get_u32(buf, 24),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        set_u32(buf, 0, 0);
        set_u32(buf, 4, self.owner_version);
        set_u64(buf, 8, self.owner);
        set_u64(buf, 16, self.base_oid);
        set_u32(buf, 24, self.count);
    }
}

/// Header of a state chunk, followed by 8-byte state slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateChunkHeader {
    pub owner: u64,
    pub owner_version: u32,
    pub count: u16,
    pub last_added: u16,
}

impl StateChunkHeader {
    pub const SIZE: usize = 16;
    pub const SLOT_SIZE: usize = 8;

    pub fn read(buf: &[u8]) -> Self {
        Self {
            owner: get_u64(buf, 0),
            owner_version: get_u32(buf, 8),
            count: get_u16(buf, 12),
            last_added: get_u16(buf, 14),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        set_u64(buf, 0, self.owner);
        set_u32(buf, 8, self.owner_version);
        set_u16(buf, 12, self.count);
        set_u16(buf, 14, self.last_added);
    }
}

/// Flags of a state slot.
pub mod state_flag {
    pub const EMPTY: u8 = 0;
    pub const RESERVED: u8 = 1;
    pub const VALID: u8 = 2;
}

/// One state slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSlot {
    pub value: u32,
    pub flag: u8,
}

impl StateSlot {
    pub fn read(buf: &[u8]) -> Self {
        Self {
            value: get_u32(buf, 0),
            flag: buf[4],
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        set_u32(buf, 0, self.value);
        buf[4] = self.flag;
        buf[5..8].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        let d = Descriptor {
            total_length: 300,
            granule_index: 2,
            attribute: 0xaa,
            state: 0xbb,
            next_handle: 0x0002_0000_0000_1000,
            data_length: 200,
            data_type: data_type::REFERENCES,
            pool_id: 1,
        };
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        d.write(&mut buf);
        assert_eq!(Descriptor::read(&buf), d);
        assert_eq!(Descriptor::data_type_of(&buf), data_type::REFERENCES);

        Descriptor::set_data_type(&mut buf, data_type::FREE_GRANULE);
        Descriptor::set_state(&mut buf, 5);
        let d2 = Descriptor::read(&buf);
        assert_eq!(d2.data_type, data_type::FREE_GRANULE);
        assert_eq!(d2.state, 5);
    }

    #[test]
    fn test_chunk_headers() {
        let mut buf = [0u8; 64];
        let h = RefChunkHeader {
            owner: 1,
            base_oid: 100,
            owner_version: 3,
            count: 8,
        };
        h.write(&mut buf);
        assert_eq!(RefChunkHeader::read(&buf), h);

        let r = Reference {
            ref_handle: 9,
            value: 4,
            state: 1,
            flag: 0,
        };
        r.write(&mut buf[24..40]);
        assert_eq!(Reference::read(&buf[24..40]), r);

        let s = StateChunkHeader {
            owner: 7,
            owner_version: 2,
            count: 16,
            last_added: 3,
        };
        s.write(&mut buf);
        assert_eq!(StateChunkHeader::read(&buf), s);

        let rs = RefStateChunkHeader {
            owner_version: 1,
            owner: 2,
            base_oid: 3,
            count: 4,
        };
        rs.write(&mut buf);
        assert_eq!(RefStateChunkHeader::read(&buf), rs);
    }
}
