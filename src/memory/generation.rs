//! One generation: an arena of granule pools addressed by byte offset.

use crate::config::PoolConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::memory::layout::{data_type, Descriptor, RefChunkHeader, DESCRIPTOR_SIZE};
use crate::types::{GenId, GenToken, Handle};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Bytes at the start of every generation that never hold granules.
pub const GEN_RESERVED: u64 = 256;

/// Lifecycle of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenState {
    Free,
    Active,
    ClosePending,
    WritePending,
    WriteCompleted,
}

impl GenState {
    pub fn as_u8(self) -> u8 {
        match self {
            GenState::Free => 0,
            GenState::Active => 1,
            GenState::ClosePending => 2,
            GenState::WritePending => 3,
            GenState::WriteCompleted => 4,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => GenState::Free,
            1 => GenState::Active,
            2 => GenState::ClosePending,
            3 => GenState::WritePending,
            4 => GenState::WriteCompleted,
            other => {
                return Err(ProtocolError::Malformed(format!("bad generation state {}", other)).into())
            }
        })
    }
}

/// Placement of one granule pool inside a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDesc {
    pub pool_id: u8,
    pub offset: u64,
    pub granule_size: u32,
    pub count: u32,
}

impl PoolDesc {
    pub fn end(&self) -> u64 {
        self.offset + self.count as u64 * self.granule_size as u64
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }

    /// Bytes of payload a granule carries after its descriptor.
    pub fn payload(&self) -> usize {
        self.granule_size as usize - DESCRIPTOR_SIZE
    }

    pub fn granule_offset(&self, index: u32) -> u64 {
        self.offset + index as u64 * self.granule_size as u64
    }
}

/// Generation header, shipped with every generation image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenHeader {
    pub gen_id: GenId,
    pub state: GenState,
    pub token: GenToken,
    pub mem_size: u64,
    pub pools: Vec<PoolDesc>,
    /// Reference chunks per owner, ordered by base order id. Rebuilt when a
    /// generation is sealed.
    #[serde(default)]
    pub owner_chunks: BTreeMap<u64, Vec<u64>>,
}

impl GenHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// Compacted form of a generation: live granules only.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompactImage {
    header: GenHeader,
    bitmaps: Vec<Vec<u8>>,
    granules: Vec<u8>,
}

/// An in-memory generation.
#[derive(Debug, Clone)]
pub struct Generation {
    header: GenHeader,
    data: Vec<u8>,
    cursors: Vec<u32>,
}

impl Generation {
    /// Lay out a fresh, empty generation.
    pub fn new(gen_id: GenId, mem_size: u64, pools: &[PoolConfig]) -> Result<Self> {
        let area = mem_size
            .checked_sub(GEN_RESERVED)
            .ok_or_else(|| Error::Config(format!("generation size {} too small", mem_size)))?;
        let mut offset = GEN_RESERVED;
        let mut descs = Vec::with_capacity(pools.len());
        for (i, p) in pools.iter().enumerate() {
            let gs = p.granule_size as u64;
            offset = offset.div_ceil(gs) * gs;
            let share = area * p.percent as u64 / 100;
            let count = (share / gs).min(mem_size.saturating_sub(offset) / gs) as u32;
            if count == 0 {
                return Err(Error::Config(format!("pool {} of generation {} is empty", i, gen_id)));
            }
            descs.push(PoolDesc {
                pool_id: i as u8,
                offset,
                granule_size: p.granule_size,
                count,
            });
            offset += count as u64 * gs;
        }
        Ok(Self {
            cursors: vec![0; descs.len()],
            header: GenHeader {
                gen_id,
                state: GenState::Free,
                token: GenToken::generate(),
                mem_size,
                pools: descs,
                owner_chunks: BTreeMap::new(),
            },
            data: vec![0u8; mem_size as usize],
        })
    }

    /// Build a generation from a header and raw memory.
    pub fn from_parts(header: GenHeader, data: Vec<u8>) -> Result<Self> {
        if data.len() as u64 != header.mem_size {
            return Err(Error::malformed(format!(
                "generation {} data is {} bytes, header says {}",
                header.gen_id,
                data.len(),
                header.mem_size
            )));
        }
        Ok(Self {
            cursors: vec![0; header.pools.len()],
            header,
            data,
        })
    }

    pub fn id(&self) -> GenId {
        self.header.gen_id
    }

    pub fn header(&self) -> &GenHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut GenHeader {
        &mut self.header
    }

    pub fn state(&self) -> GenState {
        self.header.state
    }

    pub fn set_state(&mut self, state: GenState) {
        self.header.state = state;
    }

    pub fn token(&self) -> GenToken {
        self.header.token
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pool(&self, pool_id: u8) -> Result<&PoolDesc> {
        self.header
            .pools
            .get(pool_id as usize)
            .ok_or_else(|| Error::malformed(format!("generation {} has no pool {}", self.id(), pool_id)))
    }

    pub fn pool_count(&self) -> usize {
        self.header.pools.len()
    }

    /// Offset of the granule containing `offset`, with its pool.
    pub fn granule_base(&self, offset: u64) -> Result<(&PoolDesc, u64)> {
        let pool = self
            .header
            .pools
            .iter()
            .find(|p| p.contains(offset))
            .ok_or(ProtocolError::InvalidHandle(Handle::new(self.id(), offset).raw()))?;
        let idx = (offset - pool.offset) / pool.granule_size as u64;
        Ok((pool, pool.offset + idx * pool.granule_size as u64))
    }

    fn check(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if offset >= GEN_RESERVED && end <= self.data.len() => Ok(start..end),
            _ => Err(ProtocolError::InvalidHandle(Handle::new(self.id(), offset).raw()).into()),
        }
    }

    pub fn bytes(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let range = self.check(offset, len)?;
        Ok(&self.data[range])
    }

    pub fn bytes_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let range = self.check(offset, len)?;
        Ok(&mut self.data[range])
    }

    pub fn descriptor(&self, offset: u64) -> Result<Descriptor> {
        Ok(Descriptor::read(self.bytes(offset, DESCRIPTOR_SIZE)?))
    }

    fn is_free(&self, offset: u64) -> bool {
        Descriptor::data_type_of(&self.data[offset as usize..]) == data_type::FREE_GRANULE
    }

    fn take_free(&mut self, pool_idx: usize, n: usize) -> Result<Vec<u64>> {
        let pool = self.header.pools[pool_idx].clone();
        let mut found = Vec::with_capacity(n);
        let start = self.cursors[pool_idx];
        for step in 0..pool.count {
            let idx = (start + step) % pool.count;
            let off = pool.granule_offset(idx);
            if self.is_free(off) {
                found.push(off);
                if found.len() == n {
                    self.cursors[pool_idx] = (idx + 1) % pool.count;
                    return Ok(found);
                }
            }
        }
        Err(Error::Allocate(format!(
            "generation {} pool {} has fewer than {} free granules",
            self.id(),
            pool.pool_id,
            n
        )))
    }

    /// Allocate a record spanning as many granules as `payload` needs.
    pub fn allocate(
        &mut self,
        pool_id: u8,
        dtype: u16,
        attribute: u64,
        state: u64,
        payload: &[u8],
    ) -> Result<Handle> {
        let pool = self.pool(pool_id)?.clone();
        let per = pool.payload();
        let n = payload.len().div_ceil(per).max(1);
        let granules = self.take_free(pool_id as usize, n)?;
        let gen_id = self.id();
        for (i, &off) in granules.iter().enumerate() {
            let chunk = &payload[(i * per).min(payload.len())..((i + 1) * per).min(payload.len())];
            let next = granules
                .get(i + 1)
                .map(|&o| Handle::new(gen_id, o).raw())
                .unwrap_or(0);
            let d = Descriptor {
                total_length: payload.len() as u32,
                granule_index: i as u32,
                attribute,
                state,
                next_handle: next,
                data_length: chunk.len() as u32,
                data_type: dtype,
                pool_id,
            };
            let granule = self.bytes_mut(off, pool.granule_size as usize)?;
            granule.fill(0);
            d.write(granule);
            granule[DESCRIPTOR_SIZE..DESCRIPTOR_SIZE + chunk.len()].copy_from_slice(chunk);
        }
        Ok(Handle::new(gen_id, granules[0]))
    }

    /// Allocate one zeroed chunk granule of the given type.
    pub fn allocate_chunk(&mut self, pool_id: u8, dtype: u16) -> Result<Handle> {
        let len = self.pool(pool_id)?.payload();
        self.allocate(pool_id, dtype, 0, 0, &vec![0u8; len])
    }

    /// Mark a granule free and zero it.
    pub fn free_granule(&mut self, offset: u64) -> Result<()> {
        let (pool, base) = self.granule_base(offset)?;
        let size = pool.granule_size as usize;
        let granule = self.bytes_mut(base, size)?;
        granule.fill(0);
        Descriptor::set_data_type(granule, data_type::FREE_GRANULE);
        Ok(())
    }

    /// Granule offsets of the record starting at `offset`, following
    /// `next_handle` within this generation.
    pub fn chain(&self, offset: u64) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let mut cur = Handle::new(self.id(), offset);
        while !cur.is_null() {
            if cur.gen_id() != self.id() || out.len() > self.data.len() / DESCRIPTOR_SIZE {
                return Err(ProtocolError::InvalidHandle(cur.raw()).into());
            }
            let d = self.descriptor(cur.offset())?;
            out.push(cur.offset());
            cur = Handle::from_raw(d.next_handle);
        }
        Ok(out)
    }

    /// Payload of a record assembled from its chain.
    pub fn read_record(&self, offset: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for off in self.chain(offset)? {
            let d = self.descriptor(off)?;
            out.extend_from_slice(self.bytes(off + DESCRIPTOR_SIZE as u64, d.data_length as usize)?);
        }
        Ok(out)
    }

    /// One bit per granule, set when the granule is in use.
    pub fn live_bitmap(&self, pool_id: u8) -> Result<Vec<u8>> {
        let pool = self.pool(pool_id)?;
        let mut bits = vec![0u8; (pool.count as usize).div_ceil(8)];
        for i in 0..pool.count {
            if !self.is_free(pool.granule_offset(i)) {
                bits[i as usize / 8] |= 1 << (i % 8);
            }
        }
        Ok(bits)
    }

    /// One bit per granule, set when the granule is free.
    pub fn free_bitmap(&self, pool_id: u8) -> Result<Vec<u8>> {
        let count = self.pool(pool_id)?.count as usize;
        let mut bits = self.live_bitmap(pool_id)?;
        for b in bits.iter_mut() {
            *b = !*b;
        }
        if count % 8 != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= (1u8 << (count % 8)) - 1;
            }
        }
        Ok(bits)
    }

    /// Free every granule whose bit is set in `bitmap`.
    pub fn apply_free_bitmap(&mut self, pool_id: u8, bitmap: &[u8]) -> Result<usize> {
        let pool = self.pool(pool_id)?.clone();
        if bitmap.len() < (pool.count as usize).div_ceil(8) {
            return Err(ProtocolError::BadLength {
                what: "granule bitmap",
                len: bitmap.len(),
            }
            .into());
        }
        let mut freed = 0;
        for i in 0..pool.count {
            if bitmap[i as usize / 8] & (1 << (i % 8)) != 0 {
                let off = pool.granule_offset(i);
                if !self.is_free(off) {
                    self.free_granule(off)?;
                    freed += 1;
                }
            }
        }
        Ok(freed)
    }

    /// Index the reference chunks of pool 0 by owner.
    pub fn link_ref_chunks(&mut self) -> Result<usize> {
        let pool = self.pool(0)?.clone();
        let mut index: BTreeMap<u64, Vec<(u64, u64)>> = BTreeMap::new();
        for i in 0..pool.count {
            let off = pool.granule_offset(i);
            let granule = self.bytes(off, pool.granule_size as usize)?;
            if Descriptor::data_type_of(granule) == data_type::REFERENCES {
                let h = RefChunkHeader::read(&granule[DESCRIPTOR_SIZE..]);
                index
                    .entry(h.owner)
                    .or_default()
                    .push((h.base_oid, Handle::new(self.id(), off).raw()));
            }
        }
        let linked = index.values().map(|v| v.len()).sum();
        self.header.owner_chunks = index
            .into_iter()
            .map(|(owner, mut chunks)| {
                chunks.sort_unstable();
                (owner, chunks.into_iter().map(|(_, h)| h).collect())
            })
            .collect();
        Ok(linked)
    }

    /// Serialize the live granules of this generation.
    pub fn compact(&self) -> Result<Vec<u8>> {
        let bitmaps = (0..self.pool_count())
            .map(|p| self.live_bitmap(p as u8))
            .collect::<Result<Vec<_>>>()?;
        self.compact_with(bitmaps)
    }

    /// Serialize the granules selected by per-pool live bitmaps.
    pub fn compact_with(&self, bitmaps: Vec<Vec<u8>>) -> Result<Vec<u8>> {
        if bitmaps.len() != self.pool_count() {
            return Err(Error::malformed(format!(
                "{} bitmaps for {} pools",
                bitmaps.len(),
                self.pool_count()
            )));
        }
        let mut granules = Vec::new();
        for (pool, bits) in self.header.pools.iter().zip(&bitmaps) {
            for i in 0..pool.count {
                if bits.get(i as usize / 8).copied().unwrap_or(0) & (1 << (i % 8)) != 0 {
                    granules.extend_from_slice(
                        self.bytes(pool.granule_offset(i), pool.granule_size as usize)?,
                    );
                }
            }
        }
        let image = CompactImage {
            header: self.header.clone(),
            bitmaps,
            granules,
        };
        Ok(bincode::serialize(&image)?)
    }

    /// Rebuild a generation from [`Generation::compact`] output.
    pub fn expand(image: &[u8]) -> Result<Self> {
        let image: CompactImage = bincode::deserialize(image)?;
        let mut data = vec![0u8; image.header.mem_size as usize];
        let mut src = 0usize;
        for (pool, bits) in image.header.pools.iter().zip(&image.bitmaps) {
            let gs = pool.granule_size as usize;
            for i in 0..pool.count {
                if bits.get(i as usize / 8).copied().unwrap_or(0) & (1 << (i % 8)) != 0 {
                    let dst = pool.granule_offset(i) as usize;
                    let chunk = image
                        .granules
                        .get(src..src + gs)
                        .ok_or_else(|| Error::malformed("generation image truncated"))?;
                    data.get_mut(dst..dst + gs)
                        .ok_or_else(|| Error::malformed("generation image exceeds memory"))?
                        .copy_from_slice(chunk);
                    src += gs;
                }
            }
        }
        Self::from_parts(image.header, data)
    }

    /// Header stored in an image, without expanding it.
    pub fn image_header(image: &[u8]) -> Result<GenHeader> {
        let image: CompactImage = bincode::deserialize(image)?;
        Ok(image.header)
    }

    /// Digest of the header and memory, for comparing copies.
    pub fn fingerprint(&self) -> u32 {
        let mut digest = CRC32.digest();
        digest.update(&self.header.gen_id.to_le_bytes());
        digest.update(&[self.header.state.as_u8()]);
        digest.update(&self.header.token.to_bytes());
        digest.update(&self.data);
        digest.finalize()
    }

    /// Structural check of every allocated granule.
    pub fn validate(&self) -> Result<()> {
        for pool in &self.header.pools {
            for i in 0..pool.count {
                let off = pool.granule_offset(i);
                let d = self.descriptor(off)?;
                if d.data_type == data_type::FREE_GRANULE {
                    continue;
                }
                if d.pool_id != pool.pool_id || d.data_length as usize > pool.payload() {
                    return Err(Error::Internal(format!(
                        "generation {} granule {:#x}: bad descriptor {:?}",
                        self.id(),
                        off,
                        d
                    )));
                }
                let next = Handle::from_raw(d.next_handle);
                if !next.is_null() && next.gen_id() == self.id() {
                    let nd = self.descriptor(next.offset())?;
                    if nd.data_type == data_type::FREE_GRANULE {
                        return Err(Error::Internal(format!(
                            "generation {} granule {:#x} links to free granule {:#x}",
                            self.id(),
                            off,
                            next.offset()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
