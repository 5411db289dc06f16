//! Store operations: wire encoding, expansion from engine requests and
//! application to a generation store.
//!
//! The same [`Operation::apply`] runs on the primary when a store-transaction
//! commits, on the standby when it arrives over HA, and during log replay.
//! Reference, state and reference-state chunks are materialized lazily: a
//! chunk whose owner, base order id or owner version does not match the
//! operation is reinitialized before its slot is written.

use crate::codec::{RawOp, WireReader};
use crate::error::{ProtocolError, Result};
use crate::memory::layout::{
    data_type, split_item, state_flag, Descriptor, RefChunkHeader, RefStateChunkHeader, Reference,
    StateChunkHeader, StateSlot, DESCRIPTOR_SIZE,
};
use crate::memory::MemoryStore;
use crate::types::{GenId, Handle};
use bytes::{BufMut, BytesMut};

/// Operation record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpType {
    Null = 0,
    CreateRecord = 1,
    DeleteRecord = 2,
    UpdateRecord = 3,
    UpdateRecordAttr = 4,
    UpdateRecordState = 5,
    CreateReference = 6,
    DeleteReference = 7,
    UpdateReference = 8,
    UpdateRefState = 9,
    CreateState = 10,
    DeleteState = 11,
    UpdateActiveOid = 12,
    AllocateGranulesMap = 50,
    CreateGranulesMap = 51,
    SetGranulesMap = 52,
}

impl OpType {
    pub fn from_u16(v: u16) -> Result<Self> {
        use OpType::*;
        Ok(match v {
            0 => Null,
            1 => CreateRecord,
            2 => DeleteRecord,
            3 => UpdateRecord,
            4 => UpdateRecordAttr,
            5 => UpdateRecordState,
            6 => CreateReference,
            7 => DeleteReference,
            8 => UpdateReference,
            9 => UpdateRefState,
            10 => CreateState,
            11 => DeleteState,
            12 => UpdateActiveOid,
            50 => AllocateGranulesMap,
            51 => CreateGranulesMap,
            52 => SetGranulesMap,
            other => return Err(ProtocolError::UnknownOperation(other).into()),
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Raw bytes (descriptor and data) of one granule of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranuleImage {
    pub handle: Handle,
    pub bytes: Vec<u8>,
}

/// A replicated store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateRecord {
        data_type: u16,
        granules: Vec<GranuleImage>,
    },
    DeleteRecord {
        granules: Vec<Handle>,
    },
    UpdateRecord {
        handle: Handle,
        attribute: u64,
        state: u64,
    },
    UpdateRecordAttr {
        handle: Handle,
        attribute: u64,
    },
    UpdateRecordState {
        handle: Handle,
        state: u64,
    },
    CreateReference {
        handle: Handle,
        owner: Handle,
        base_oid: u64,
        ref_handle: u64,
        value: u32,
        state: u8,
    },
    UpdateReference {
        handle: Handle,
        state: u8,
    },
    DeleteReference {
        handle: Handle,
    },
    UpdateRefState {
        handle: Handle,
        owner: Handle,
        base_oid: u64,
        state: u8,
    },
    CreateState {
        handle: Handle,
        owner: Handle,
        value: u32,
    },
    DeleteState {
        handle: Handle,
    },
    UpdateActiveOid {
        handle: Handle,
        oid: u64,
    },
}

impl Operation {
    pub fn op_type(&self) -> OpType {
        match self {
            Operation::CreateRecord { .. } => OpType::CreateRecord,
            Operation::DeleteRecord { .. } => OpType::DeleteRecord,
            Operation::UpdateRecord { .. } => OpType::UpdateRecord,
            Operation::UpdateRecordAttr { .. } => OpType::UpdateRecordAttr,
            Operation::UpdateRecordState { .. } => OpType::UpdateRecordState,
            Operation::CreateReference { .. } => OpType::CreateReference,
            Operation::UpdateReference { .. } => OpType::UpdateReference,
            Operation::DeleteReference { .. } => OpType::DeleteReference,
            Operation::UpdateRefState { .. } => OpType::UpdateRefState,
            Operation::CreateState { .. } => OpType::CreateState,
            Operation::DeleteState { .. } => OpType::DeleteState,
            Operation::UpdateActiveOid { .. } => OpType::UpdateActiveOid,
        }
    }

    /// Generation the operation writes into.
    pub fn gen_id(&self) -> Option<GenId> {
        let handle = match self {
            Operation::CreateRecord { granules, .. } => granules.first().map(|g| g.handle),
            Operation::DeleteRecord { granules } => granules.first().copied(),
            Operation::UpdateRecord { handle, .. }
            | Operation::UpdateRecordAttr { handle, .. }
            | Operation::UpdateRecordState { handle, .. }
            | Operation::CreateReference { handle, .. }
            | Operation::UpdateReference { handle, .. }
            | Operation::DeleteReference { handle }
            | Operation::UpdateRefState { handle, .. }
            | Operation::CreateState { handle, .. }
            | Operation::DeleteState { handle }
            | Operation::UpdateActiveOid { handle, .. } => Some(*handle),
        };
        handle.map(|h| h.gen_id())
    }

    /// Payload size on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Operation::CreateRecord { granules, .. } => {
                6 + granules.iter().map(|g| 12 + g.bytes.len()).sum::<usize>()
            }
            Operation::DeleteRecord { granules } => 4 + 8 * granules.len(),
            Operation::UpdateRecord { .. } => 24,
            Operation::UpdateRecordAttr { .. } | Operation::UpdateRecordState { .. } => 16,
            Operation::CreateReference { .. } => 37,
            Operation::UpdateReference { .. } => 9,
            Operation::DeleteReference { .. } | Operation::DeleteState { .. } => 8,
            Operation::UpdateRefState { .. } => 25,
            Operation::CreateState { .. } => 20,
            Operation::UpdateActiveOid { .. } => 16,
        }
    }

    /// Append the payload (without the op header).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Operation::CreateRecord { data_type, granules } => {
                buf.put_u16(*data_type);
                buf.put_u32(granules.len() as u32);
                for g in granules {
                    buf.put_u64(g.handle.raw());
                    buf.put_u32(g.bytes.len() as u32);
                    buf.put_slice(&g.bytes);
                }
            }
            Operation::DeleteRecord { granules } => {
                buf.put_u32(granules.len() as u32);
                for h in granules {
                    buf.put_u64(h.raw());
                }
            }
            Operation::UpdateRecord {
                handle,
                attribute,
                state,
            } => {
                buf.put_u64(handle.raw());
                buf.put_u64(*attribute);
                buf.put_u64(*state);
            }
            Operation::UpdateRecordAttr { handle, attribute } => {
                buf.put_u64(handle.raw());
                buf.put_u64(*attribute);
            }
            Operation::UpdateRecordState { handle, state } => {
                buf.put_u64(handle.raw());
                buf.put_u64(*state);
            }
            Operation::CreateReference {
                handle,
                owner,
                base_oid,
                ref_handle,
                value,
                state,
            } => {
                buf.put_u64(handle.raw());
                buf.put_u64(owner.raw());
                buf.put_u64(*base_oid);
                buf.put_u64(*ref_handle);
                buf.put_u32(*value);
                buf.put_u8(*state);
            }
            Operation::UpdateReference { handle, state } => {
                buf.put_u64(handle.raw());
                buf.put_u8(*state);
            }
            Operation::DeleteReference { handle } | Operation::DeleteState { handle } => {
                buf.put_u64(handle.raw());
            }
            Operation::UpdateRefState {
                handle,
                owner,
                base_oid,
                state,
            } => {
                buf.put_u64(handle.raw());
                buf.put_u64(owner.raw());
                buf.put_u64(*base_oid);
                buf.put_u8(*state);
            }
            Operation::CreateState { handle, owner, value } => {
                buf.put_u64(handle.raw());
                buf.put_u64(owner.raw());
                buf.put_u32(*value);
            }
            Operation::UpdateActiveOid { handle, oid } => {
                buf.put_u64(handle.raw());
                buf.put_u64(*oid);
            }
        }
    }

    pub fn decode(op: &RawOp<'_>) -> Result<Self> {
        let mut r = WireReader::new(op.payload);
        let decoded = match OpType::from_u16(op.op_type)? {
            OpType::CreateRecord => {
                let data_type = r.u16()?;
                let count = r.u32()? as usize;
                let mut granules = Vec::with_capacity(count.min(r.remaining() / 12));
                for _ in 0..count {
                    let handle = r.handle()?;
                    let len = r.u32()? as usize;
                    granules.push(GranuleImage {
                        handle,
                        bytes: r.bytes(len)?.to_vec(),
                    });
                }
                Operation::CreateRecord { data_type, granules }
            }
            OpType::DeleteRecord => {
                let count = r.u32()? as usize;
                let granules = (0..count).map(|_| r.handle()).collect::<Result<Vec<_>>>()?;
                Operation::DeleteRecord { granules }
            }
            OpType::UpdateRecord => Operation::UpdateRecord {
                handle: r.handle()?,
                attribute: r.u64()?,
                state: r.u64()?,
            },
            OpType::UpdateRecordAttr => Operation::UpdateRecordAttr {
                handle: r.handle()?,
                attribute: r.u64()?,
            },
            OpType::UpdateRecordState => Operation::UpdateRecordState {
                handle: r.handle()?,
                state: r.u64()?,
            },
            OpType::CreateReference => Operation::CreateReference {
                handle: r.handle()?,
                owner: r.handle()?,
                base_oid: r.u64()?,
                ref_handle: r.u64()?,
                value: r.u32()?,
                state: r.u8()?,
            },
            OpType::UpdateReference => Operation::UpdateReference {
                handle: r.handle()?,
                state: r.u8()?,
            },
            OpType::DeleteReference => Operation::DeleteReference { handle: r.handle()? },
            OpType::UpdateRefState => Operation::UpdateRefState {
                handle: r.handle()?,
                owner: r.handle()?,
                base_oid: r.u64()?,
                state: r.u8()?,
            },
            OpType::CreateState => Operation::CreateState {
                handle: r.handle()?,
                owner: r.handle()?,
                value: r.u32()?,
            },
            OpType::DeleteState => Operation::DeleteState { handle: r.handle()? },
            OpType::UpdateActiveOid => Operation::UpdateActiveOid {
                handle: r.handle()?,
                oid: r.u64()?,
            },
            other @ (OpType::Null
            | OpType::AllocateGranulesMap
            | OpType::CreateGranulesMap
            | OpType::SetGranulesMap) => {
                return Err(ProtocolError::UnknownOperation(other.as_u16()).into())
            }
        };
        r.finish("operation")?;
        Ok(decoded)
    }

    /// Apply to the store. Every mutated range is written back.
    pub fn apply(&self, store: &MemoryStore) -> Result<()> {
        match self {
            Operation::CreateRecord { data_type, granules } => {
                for g in granules {
                    if g.bytes.len() < DESCRIPTOR_SIZE {
                        return Err(ProtocolError::BadLength {
                            what: "record granule",
                            len: g.bytes.len(),
                        }
                        .into());
                    }
                    let (_, _, size) = granule_of(store, g.handle)?;
                    if g.bytes.len() > size {
                        return Err(ProtocolError::BadLength {
                            what: "record granule",
                            len: g.bytes.len(),
                        }
                        .into());
                    }
                    let mut bytes = g.bytes.clone();
                    Descriptor::set_data_type(&mut bytes, *data_type);
                    store.write(g.handle, &bytes)?;
                }
                Ok(())
            }
            Operation::DeleteRecord { granules } => {
                for h in granules {
                    let (base, _, size) = granule_of(store, *h)?;
                    store.with_gen_mut(h.gen_id(), |g| g.free_granule(base.offset()))?;
                    store.flush(base, size);
                }
                Ok(())
            }
            Operation::UpdateRecord {
                handle,
                attribute,
                state,
            } => update_descriptor(store, *handle, Some(*attribute), Some(*state)),
            Operation::UpdateRecordAttr { handle, attribute } => {
                update_descriptor(store, *handle, Some(*attribute), None)
            }
            Operation::UpdateRecordState { handle, state } => {
                update_descriptor(store, *handle, None, Some(*state))
            }
            Operation::CreateReference {
                handle,
                owner,
                base_oid,
                ref_handle,
                value,
                state,
            } => {
                let slot = Reference {
                    ref_handle: *ref_handle,
                    value: *value,
                    state: *state,
                    flag: 0,
                };
                with_chunk(store, *handle, Some((*owner, *base_oid)), ChunkKind::References, |chunk, at| {
                    slot.write(&mut chunk[at..at + RefChunkHeader::SLOT_SIZE]);
                })
            }
            Operation::UpdateReference { handle, state } => {
                with_chunk(store, *handle, None, ChunkKind::References, |chunk, at| {
                    chunk[at + 12] = *state;
                })
            }
            Operation::DeleteReference { handle } => {
                with_chunk(store, *handle, None, ChunkKind::References, |chunk, at| {
                    chunk[at..at + RefChunkHeader::SLOT_SIZE].fill(0);
                })
            }
            Operation::UpdateRefState {
                handle,
                owner,
                base_oid,
                state,
            } => with_chunk(store, *handle, Some((*owner, *base_oid)), ChunkKind::RefStates, |chunk, at| {
                chunk[at] = *state;
            }),
            Operation::CreateState { handle, owner, value } => {
                let slot = StateSlot {
                    value: *value,
                    flag: state_flag::VALID,
                };
                with_chunk(store, *handle, Some((*owner, 0)), ChunkKind::States, |chunk, at| {
                    slot.write(&mut chunk[at..at + StateChunkHeader::SLOT_SIZE]);
                    let mut h = StateChunkHeader::read(&chunk[DESCRIPTOR_SIZE..]);
                    h.last_added = ((at - DESCRIPTOR_SIZE - StateChunkHeader::SIZE) / StateChunkHeader::SLOT_SIZE) as u16;
                    h.write(&mut chunk[DESCRIPTOR_SIZE..]);
                })
            }
            Operation::DeleteState { handle } => {
                with_chunk(store, *handle, None, ChunkKind::States, |chunk, at| {
                    StateSlot::default().write(&mut chunk[at..at + StateChunkHeader::SLOT_SIZE]);
                })
            }
            Operation::UpdateActiveOid { handle, oid } => store.write(*handle, &oid.to_le_bytes()),
        }
    }
}

/// Granule containing `handle`: base handle, pool id and granule size.
fn granule_of(store: &MemoryStore, handle: Handle) -> Result<(Handle, u8, usize)> {
    store.with_gen(handle.gen_id(), |g| {
        let (pool, base) = g.granule_base(handle.offset())?;
        Ok((Handle::new(handle.gen_id(), base), pool.pool_id, pool.granule_size as usize))
    })
}

fn update_descriptor(store: &MemoryStore, handle: Handle, attribute: Option<u64>, state: Option<u64>) -> Result<()> {
    store.with_gen_mut(handle.gen_id(), |g| {
        let desc = g.bytes_mut(handle.offset(), DESCRIPTOR_SIZE)?;
        if let Some(a) = attribute {
            Descriptor::set_attribute(desc, a);
        }
        if let Some(s) = state {
            Descriptor::set_state(desc, s);
        }
        Ok(())
    })?;
    store.flush(handle, DESCRIPTOR_SIZE);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    References,
    RefStates,
    States,
}

impl ChunkKind {
    fn data_type(self) -> u16 {
        match self {
            ChunkKind::References => data_type::REFERENCES,
            ChunkKind::RefStates => data_type::REF_STATES,
            ChunkKind::States => data_type::STATES,
        }
    }

    fn header_size(self) -> usize {
        match self {
            ChunkKind::References => RefChunkHeader::SIZE,
            ChunkKind::RefStates => RefStateChunkHeader::SIZE,
            ChunkKind::States => StateChunkHeader::SIZE,
        }
    }

    fn slot_size(self) -> usize {
        match self {
            ChunkKind::References => RefChunkHeader::SLOT_SIZE,
            ChunkKind::RefStates => 1,
            ChunkKind::States => StateChunkHeader::SLOT_SIZE,
        }
    }

    /// Whether the chunk header matches the expected owner.
    fn matches(self, chunk: &[u8], owner: Handle, base_oid: u64, version: u32) -> bool {
        if Descriptor::data_type_of(chunk) != self.data_type() {
            return false;
        }
        let h = &chunk[DESCRIPTOR_SIZE..];
        match self {
            ChunkKind::References => {
                let h = RefChunkHeader::read(h);
                h.owner == owner.raw() && h.base_oid == base_oid && h.owner_version == version
            }
            ChunkKind::RefStates => {
                let h = RefStateChunkHeader::read(h);
                h.owner == owner.raw() && h.base_oid == base_oid && h.owner_version == version
            }
            ChunkKind::States => {
                let h = StateChunkHeader::read(h);
                h.owner == owner.raw() && h.owner_version == version
            }
        }
    }

    /// Retag the chunk and clear its slots.
    fn reinit(self, chunk: &mut [u8], pool_id: u8, owner: Handle, base_oid: u64, version: u32, limit: usize) {
        let payload = chunk.len() - DESCRIPTOR_SIZE;
        chunk.fill(0);
        Descriptor {
            total_length: payload as u32,
            data_length: payload as u32,
            data_type: self.data_type(),
            pool_id,
            ..Descriptor::default()
        }
        .write(chunk);
        let count = ((payload - self.header_size()) / self.slot_size()).min(limit);
        let h = &mut chunk[DESCRIPTOR_SIZE..];
        match self {
            ChunkKind::References => RefChunkHeader {
                owner: owner.raw(),
                base_oid,
                owner_version: version,
                count: count as u32,
            }
            .write(h),
            ChunkKind::RefStates => {
                RefStateChunkHeader {
                    owner_version: version,
                    owner: owner.raw(),
                    base_oid,
                    count: count as u32,
                }
                .write(h);
                h[RefStateChunkHeader::SIZE..].fill(RefStateChunkHeader::NOT_VALID);
            }
            ChunkKind::States => StateChunkHeader {
                owner: owner.raw(),
                owner_version: version,
                count: count as u16,
                last_added: 0,
            }
            .write(h),
        }
    }
}

/// Write one slot of a chunk. With `expect`, the chunk is reinitialized
/// first when it belongs to someone else; without it, a chunk of the wrong
/// type is left alone.
fn with_chunk(
    store: &MemoryStore,
    handle: Handle,
    expect: Option<(Handle, u64)>,
    kind: ChunkKind,
    write: impl FnOnce(&mut [u8], usize),
) -> Result<()> {
    let (base, pool_id, size) = granule_of(store, handle)?;
    let at = (handle.offset() - base.offset()) as usize;
    let first_slot = DESCRIPTOR_SIZE + kind.header_size();
    if at < first_slot || (at - first_slot) % kind.slot_size() != 0 || at + kind.slot_size() > size {
        return Err(ProtocolError::InvalidHandle(handle.raw()).into());
    }
    let limit = match kind {
        ChunkKind::References => store.config().refs_per_chunk as usize,
        ChunkKind::RefStates => usize::MAX,
        ChunkKind::States => store.config().states_per_chunk as usize,
    };

    let _bucket = expect.map(|(owner, _)| store.bucket_lock(owner));
    let version = match expect {
        Some((owner, _)) => Some(store.owner_version(owner)?),
        None => None,
    };
    let applied = store.with_gen_mut(handle.gen_id(), |g| {
        let chunk = g.bytes_mut(base.offset(), size)?;
        match (expect, version) {
            (Some((owner, base_oid)), Some(version)) => {
                if !kind.matches(chunk, owner, base_oid, version) {
                    kind.reinit(chunk, pool_id, owner, base_oid, version, limit);
                }
            }
            _ => {
                if Descriptor::data_type_of(chunk) != kind.data_type() {
                    return Ok(false);
                }
            }
        }
        let count = match kind {
            ChunkKind::References => RefChunkHeader::read(&chunk[DESCRIPTOR_SIZE..]).count as usize,
            ChunkKind::RefStates => RefStateChunkHeader::read(&chunk[DESCRIPTOR_SIZE..]).count as usize,
            ChunkKind::States => StateChunkHeader::read(&chunk[DESCRIPTOR_SIZE..]).count as usize,
        };
        if (at - first_slot) / kind.slot_size() >= count {
            return Err(ProtocolError::InvalidHandle(handle.raw()).into());
        }
        write(chunk, at);
        Ok(true)
    })?;
    if applied {
        store.flush(base, size);
    }
    Ok(())
}

/// An engine request, expanded against the store into an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Publish a record allocated as newly hatched under its real type.
    CreateRecord { handle: Handle, data_type: u16 },
    DeleteRecord { handle: Handle },
    UpdateRecord { handle: Handle, attribute: u64, state: u64 },
    UpdateRecordAttr { handle: Handle, attribute: u64 },
    UpdateRecordState { handle: Handle, state: u64 },
    CreateReference {
        handle: Handle,
        owner: Handle,
        base_oid: u64,
        ref_handle: u64,
        value: u32,
        state: u8,
    },
    UpdateReference { handle: Handle, state: u8 },
    DeleteReference { handle: Handle },
    UpdateRefState {
        handle: Handle,
        owner: Handle,
        base_oid: u64,
        state: u8,
    },
    CreateState { handle: Handle, owner: Handle, value: u32 },
    DeleteState { handle: Handle },
}

impl StoreOp {
    /// Resolve against current memory. Record operations walk the granule
    /// chain, and the large data chain of owner records.
    pub fn expand(&self, store: &MemoryStore) -> Result<Operation> {
        Ok(match self.clone() {
            StoreOp::CreateRecord { handle, data_type } => {
                let granules = store.with_gen(handle.gen_id(), |g| {
                    g.chain(handle.offset())?
                        .into_iter()
                        .map(|off| {
                            let d = g.descriptor(off)?;
                            Ok(GranuleImage {
                                handle: Handle::new(handle.gen_id(), off),
                                bytes: g.bytes(off, DESCRIPTOR_SIZE + d.data_length as usize)?.to_vec(),
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                })?;
                Operation::CreateRecord { data_type, granules }
            }
            StoreOp::DeleteRecord { handle } => {
                let mut granules = record_chain(store, handle)?;
                let desc = store.with_gen(handle.gen_id(), |g| g.descriptor(handle.offset()))?;
                if data_type::is_owner(desc.data_type) {
                    let item = store.read(handle.add(DESCRIPTOR_SIZE as u64), split_item::SIZE)?;
                    let large = Handle::from_raw(split_item::large_data(&item));
                    if !large.is_null() {
                        granules.extend(record_chain(store, large)?);
                    }
                }
                Operation::DeleteRecord { granules }
            }
            StoreOp::UpdateRecord {
                handle,
                attribute,
                state,
            } => Operation::UpdateRecord {
                handle,
                attribute,
                state,
            },
            StoreOp::UpdateRecordAttr { handle, attribute } => Operation::UpdateRecordAttr { handle, attribute },
            StoreOp::UpdateRecordState { handle, state } => Operation::UpdateRecordState { handle, state },
            StoreOp::CreateReference {
                handle,
                owner,
                base_oid,
                ref_handle,
                value,
                state,
            } => Operation::CreateReference {
                handle,
                owner,
                base_oid,
                ref_handle,
                value,
                state,
            },
            StoreOp::UpdateReference { handle, state } => Operation::UpdateReference { handle, state },
            StoreOp::DeleteReference { handle } => Operation::DeleteReference { handle },
            StoreOp::UpdateRefState {
                handle,
                owner,
                base_oid,
                state,
            } => Operation::UpdateRefState {
                handle,
                owner,
                base_oid,
                state,
            },
            StoreOp::CreateState { handle, owner, value } => Operation::CreateState { handle, owner, value },
            StoreOp::DeleteState { handle } => Operation::DeleteState { handle },
        })
    }
}

fn record_chain(store: &MemoryStore, handle: Handle) -> Result<Vec<Handle>> {
    store.with_gen(handle.gen_id(), |g| {
        Ok(g.chain(handle.offset())?
            .into_iter()
            .map(|off| Handle::new(handle.gen_id(), off))
            .collect())
    })
}

/// Apply every data op of a store-transaction, skipping `Null` ops.
pub fn apply_ops<'a>(store: &MemoryStore, ops: impl Iterator<Item = Result<RawOp<'a>>>) -> Result<usize> {
    let mut applied = 0;
    for op in ops {
        let op = op?;
        if op.op_type == OpType::Null.as_u16() {
            continue;
        }
        Operation::decode(&op)?.apply(store)?;
        applied += 1;
    }
    Ok(applied)
}

/// Handle of the min-active-order-id field of an owner record.
pub fn active_oid_handle(owner: Handle) -> Handle {
    owner.add((DESCRIPTOR_SIZE + split_item::MIN_ACTIVE_OID) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::error::Error;
    use crate::memory::{NoWriteBack, MGMT_SMALL_POOL};
    use crate::types::MGMT_GEN_ID;
    use std::sync::Arc;

    struct Fixture {
        store: MemoryStore,
        gen: u16,
        owner: Handle,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new(MemoryConfig::small(), Arc::new(NoWriteBack)).unwrap();
        let gen = store.bootstrap().unwrap();
        let owner = store
            .allocate(MGMT_GEN_ID, 0, data_type::OWNER, 0, 0, &[0u8; split_item::SIZE])
            .unwrap();
        Fixture { store, gen, owner }
    }

    fn slot(chunk: Handle, kind_header: usize, slot_size: usize, i: usize) -> Handle {
        chunk.add((DESCRIPTOR_SIZE + kind_header + i * slot_size) as u64)
    }

    fn round_trip(op: &Operation) -> Operation {
        let mut buf = BytesMut::new();
        op.encode(&mut buf);
        assert_eq!(buf.len(), op.encoded_len());
        Operation::decode(&RawOp {
            op_type: op.op_type().as_u16(),
            payload: &buf,
        })
        .unwrap()
    }

    #[test]
    fn test_create_reference_on_zeroed_chunk() {
        let f = fixture();
        let chunk = f.store.allocate_chunk(f.gen, 0, data_type::NEWLY_HATCHED).unwrap();
        let h = slot(chunk, RefChunkHeader::SIZE, RefChunkHeader::SLOT_SIZE, 3);
        let op = Operation::CreateReference {
            handle: h,
            owner: f.owner,
            base_oid: 100,
            ref_handle: 0xabc,
            value: 9,
            state: 1,
        };
        round_trip(&op).apply(&f.store).unwrap();

        let bytes = f.store.read(chunk, 512).unwrap();
        assert_eq!(Descriptor::data_type_of(&bytes), data_type::REFERENCES);
        let hdr = RefChunkHeader::read(&bytes[DESCRIPTOR_SIZE..]);
        assert_eq!(hdr.owner, f.owner.raw());
        assert_eq!(hdr.base_oid, 100);
        assert_eq!(hdr.owner_version, 0);
        let at = (h.offset() - chunk.offset()) as usize;
        let r = Reference::read(&bytes[at..]);
        assert_eq!((r.ref_handle, r.value, r.state), (0xabc, 9, 1));
    }

    #[test]
    fn test_owner_version_change_reinitializes_chunk() {
        let f = fixture();
        let chunk = f.store.allocate_chunk(f.gen, 0, data_type::REFERENCES).unwrap();
        let h0 = slot(chunk, RefChunkHeader::SIZE, RefChunkHeader::SLOT_SIZE, 0);
        let h1 = slot(chunk, RefChunkHeader::SIZE, RefChunkHeader::SLOT_SIZE, 1);
        let create = |h| Operation::CreateReference {
            handle: h,
            owner: f.owner,
            base_oid: 0,
            ref_handle: 5,
            value: 1,
            state: 0,
        };
        create(h0).apply(&f.store).unwrap();

        let mut item = f.store.read(f.owner.add(DESCRIPTOR_SIZE as u64), split_item::SIZE).unwrap();
        split_item::set_version(&mut item, 2);
        f.store.write(f.owner.add(DESCRIPTOR_SIZE as u64), &item).unwrap();

        create(h1).apply(&f.store).unwrap();
        let bytes = f.store.read(chunk, 512).unwrap();
        assert_eq!(RefChunkHeader::read(&bytes[DESCRIPTOR_SIZE..]).owner_version, 2);
        let at0 = (h0.offset() - chunk.offset()) as usize;
        assert!(Reference::read(&bytes[at0..]).is_empty());
    }

    #[test]
    fn test_delete_then_create_reference_is_repeatable() {
        let f = fixture();
        let chunk = f.store.allocate_chunk(f.gen, 0, data_type::REFERENCES).unwrap();
        let h = slot(chunk, RefChunkHeader::SIZE, RefChunkHeader::SLOT_SIZE, 2);
        let ops = vec![
            Operation::CreateReference {
                handle: h,
                owner: f.owner,
                base_oid: 0,
                ref_handle: 1,
                value: 1,
                state: 0,
            },
            Operation::DeleteReference { handle: h },
            Operation::CreateReference {
                handle: h,
                owner: f.owner,
                base_oid: 0,
                ref_handle: 2,
                value: 7,
                state: 0,
            },
        ];
        for op in &ops {
            op.apply(&f.store).unwrap();
        }
        let first = f.store.fingerprint().unwrap();
        for op in &ops {
            op.apply(&f.store).unwrap();
        }
        assert_eq!(f.store.fingerprint().unwrap(), first);
    }

    #[test]
    fn test_create_record_replaces_newly_hatched() {
        let f = fixture();
        let payload = vec![3u8; 1000];
        let h = f
            .store
            .allocate(f.gen, 0, data_type::NEWLY_HATCHED, 0, 0, &payload)
            .unwrap();
        let op = StoreOp::CreateRecord {
            handle: h,
            data_type: data_type::USER_BASE,
        }
        .expand(&f.store)
        .unwrap();
        let Operation::CreateRecord { granules, .. } = &op else {
            panic!("unexpected {:?}", op);
        };
        assert_eq!(granules.len(), 3);
        round_trip(&op).apply(&f.store).unwrap();
        f.store
            .with_gen(f.gen, |g| {
                for off in g.chain(h.offset())? {
                    assert_eq!(g.descriptor(off)?.data_type, data_type::USER_BASE);
                }
                assert_eq!(g.read_record(h.offset())?, payload);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_owner_record_follows_large_data() {
        let f = fixture();
        let large = f.store.allocate(f.gen, 1, data_type::USER_BASE, 0, 0, &[1u8; 4000]).unwrap();
        let mut item = vec![0u8; split_item::SIZE];
        split_item::set_large_data(&mut item, large.raw());
        let owner = f.store.allocate(f.gen, 0, data_type::OWNER, 0, 0, &item).unwrap();

        let op = StoreOp::DeleteRecord { handle: owner }.expand(&f.store).unwrap();
        let Operation::DeleteRecord { granules } = &op else {
            panic!("unexpected {:?}", op);
        };
        assert_eq!(granules.len(), 1 + 2);
        op.apply(&f.store).unwrap();
        op.apply(&f.store).unwrap();
        let live = f.store.with_gen(f.gen, |g| g.live_bitmap(1)).unwrap();
        assert!(live.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_states_and_ref_states() {
        let f = fixture();
        let states = f.store.allocate_chunk(MGMT_GEN_ID, 0, data_type::STATES).unwrap();
        let sh = slot(states, StateChunkHeader::SIZE, StateChunkHeader::SLOT_SIZE, 4);
        Operation::CreateState {
            handle: sh,
            owner: f.owner,
            value: 77,
        }
        .apply(&f.store)
        .unwrap();
        let at = (sh.offset() - states.offset()) as usize;
        let s = StateSlot::read(&f.store.read(states, 512).unwrap()[at..]);
        assert_eq!((s.value, s.flag), (77, state_flag::VALID));
        Operation::DeleteState { handle: sh }.apply(&f.store).unwrap();
        let s = StateSlot::read(&f.store.read(states, 512).unwrap()[at..]);
        assert_eq!(s.flag, state_flag::EMPTY);

        let rs = f
            .store
            .allocate_chunk(MGMT_GEN_ID, MGMT_SMALL_POOL, data_type::REF_STATES)
            .unwrap();
        let rh = slot(rs, RefStateChunkHeader::SIZE, 1, 5);
        Operation::UpdateRefState {
            handle: rh,
            owner: f.owner,
            base_oid: 40,
            state: 3,
        }
        .apply(&f.store)
        .unwrap();
        let bytes = f.store.read(rs, 128).unwrap();
        let first = DESCRIPTOR_SIZE + RefStateChunkHeader::SIZE;
        assert_eq!(bytes[first + 5], 3);
        assert_eq!(bytes[first + 4], RefStateChunkHeader::NOT_VALID);
    }

    #[test]
    fn test_update_active_oid_and_record_fields() {
        let f = fixture();
        let h = active_oid_handle(f.owner);
        Operation::UpdateActiveOid { handle: h, oid: 991 }.apply(&f.store).unwrap();
        let item = f.store.read(f.owner.add(DESCRIPTOR_SIZE as u64), split_item::SIZE).unwrap();
        assert_eq!(split_item::min_active_oid(&item), 991);

        let rec = f.store.allocate(f.gen, 0, data_type::USER_BASE, 1, 1, b"r").unwrap();
        round_trip(&Operation::UpdateRecord {
            handle: rec,
            attribute: 5,
            state: 6,
        })
        .apply(&f.store)
        .unwrap();
        Operation::UpdateRecordState { handle: rec, state: 8 }.apply(&f.store).unwrap();
        let d = f.store.with_gen(f.gen, |g| g.descriptor(rec.offset())).unwrap();
        assert_eq!((d.attribute, d.state), (5, 8));
    }

    #[test]
    fn test_unknown_and_misplaced_ops() {
        let err = Operation::decode(&RawOp {
            op_type: 77,
            payload: &[],
        })
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnknownOperation(77))));

        let f = fixture();
        let chunk = f.store.allocate_chunk(f.gen, 0, data_type::REFERENCES).unwrap();
        let bad = chunk.add((DESCRIPTOR_SIZE + 1) as u64);
        assert!(Operation::DeleteReference { handle: bad }.apply(&f.store).is_err());
    }
}
