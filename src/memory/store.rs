//! The generation store consumed by replication and persistence: the
//! management generation, two in-memory data generation slots, the
//! generation map, owner-bucket mutexes and read-ahead recovery images.

use crate::config::MemoryConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::memory::generation::{GenState, Generation};
use crate::memory::layout::{split_item, DESCRIPTOR_SIZE};
use crate::memory::lock::StoreGate;
use crate::types::{GenId, GenToken, Handle, FIRST_DATA_GEN_ID, MGMT_GEN_ID};
use crc::{Crc, CRC_32_ISCSI};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Pool of the management generation holding small granules.
pub const MGMT_SMALL_POOL: u8 = 1;

/// Flushes modified memory to its backing medium. A no-op unless the store
/// lives in persistent memory.
pub trait WriteBack: Send + Sync {
    fn write_back(&self, gen_id: GenId, offset: u64, len: usize);
}

/// Write-back for ordinary DRAM.
#[derive(Debug, Default)]
pub struct NoWriteBack;

impl WriteBack for NoWriteBack {
    fn write_back(&self, _gen_id: GenId, _offset: u64, _len: usize) {}
}

/// Synchronization progress of one generation while a standby joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HaSyncState {
    #[default]
    Empty,
    Proposed,
    Requested,
    Reading,
    Available,
    Sending,
    Sent,
    Error,
}

impl HaSyncState {
    pub fn can_move_to(self, next: HaSyncState) -> bool {
        use HaSyncState::*;
        matches!(
            (self, next),
            (_, Empty)
                | (_, Error)
                | (Empty, Proposed)
                | (Proposed, Requested)
                | (Requested, Reading)
                | (Requested, Available)
                | (Reading, Available)
                | (Available, Sending)
                | (Sending, Sent)
        )
    }
}

/// Generation map entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenMapEntry {
    pub token: GenToken,
    pub state: GenState,
    /// Size of the generation file, zero while it lives only in memory.
    pub disk_size: u64,
    /// In-memory slot, if resident.
    pub mem_index: Option<u8>,
    #[serde(skip)]
    pub sync_state: HaSyncState,
    #[serde(skip)]
    pub sync_len: u64,
}

impl GenMapEntry {
    pub fn new(token: GenToken, mem_index: Option<u8>) -> Self {
        Self {
            token,
            state: GenState::Free,
            disk_size: 0,
            mem_index,
            sync_state: HaSyncState::Empty,
            sync_len: 0,
        }
    }

    pub fn set_sync_state(&mut self, gen_id: GenId, next: HaSyncState) -> Result<()> {
        if !self.sync_state.can_move_to(next) {
            return Err(Error::Internal(format!(
                "generation {} cannot move from {:?} to {:?}",
                gen_id, self.sync_state, next
            )));
        }
        self.sync_state = next;
        Ok(())
    }
}

/// Management header: which generation is active and what exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MgmtHeader {
    pub active_gen_id: GenId,
    pub active_gen_index: u8,
    pub next_gen_id: GenId,
    pub gen_map: BTreeMap<GenId, GenMapEntry>,
    /// Reserved-pool assignment state.
    pub rsrv_pool_state: u8,
    pub token: GenToken,
}

impl MgmtHeader {
    fn fresh() -> Self {
        Self {
            active_gen_id: 0,
            active_gen_index: 0,
            next_gen_id: FIRST_DATA_GEN_ID,
            gen_map: BTreeMap::new(),
            rsrv_pool_state: 0,
            token: GenToken::generate(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// Management header plus the compacted management generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MgmtImage {
    header: MgmtHeader,
    generation: Vec<u8>,
}

/// The in-memory store.
pub struct MemoryStore {
    config: MemoryConfig,
    mgmt: RwLock<Generation>,
    slots: [RwLock<Option<Generation>>; 2],
    header: Mutex<MgmtHeader>,
    buckets: Vec<Mutex<()>>,
    recovery: Mutex<BTreeMap<GenId, Arc<Vec<u8>>>>,
    write_back: Arc<dyn WriteBack>,
    gate: StoreGate,
}

impl MemoryStore {
    /// Create a store with an empty management generation and no data
    /// generation.
    pub fn new(config: MemoryConfig, write_back: Arc<dyn WriteBack>) -> Result<Self> {
        config.validate()?;
        let mut mgmt = Generation::new(MGMT_GEN_ID, config.mgmt_size, &config.mgmt_pools)?;
        mgmt.set_state(GenState::Active);
        let buckets = (0..config.lock_count).map(|_| Mutex::new(())).collect();
        Ok(Self {
            config,
            mgmt: RwLock::new(mgmt),
            slots: [RwLock::new(None), RwLock::new(None)],
            header: Mutex::new(MgmtHeader::fresh()),
            buckets,
            recovery: Mutex::new(BTreeMap::new()),
            write_back,
            gate: StoreGate::new(),
        })
    }

    /// Create and activate the first data generation of a cold store.
    pub fn bootstrap(&self) -> Result<GenId> {
        let gen_id = self.header.lock().next_gen_id;
        self.create_generation(0, gen_id)?;
        self.activate_generation(gen_id, 0)?;
        info!(gen_id, "store bootstrapped");
        Ok(gen_id)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn gate(&self) -> &StoreGate {
        &self.gate
    }

    pub fn header(&self) -> MutexGuard<'_, MgmtHeader> {
        self.header.lock()
    }

    pub fn header_snapshot(&self) -> MgmtHeader {
        self.header.lock().clone()
    }

    /// Replace the management header, keeping local sync progress.
    pub fn apply_header(&self, incoming: MgmtHeader) {
        let mut header = self.header.lock();
        let mut incoming = incoming;
        for (gen_id, entry) in incoming.gen_map.iter_mut() {
            if let Some(old) = header.gen_map.get(gen_id) {
                entry.sync_state = old.sync_state;
                entry.sync_len = old.sync_len;
            }
        }
        *header = incoming;
    }

    pub fn active(&self) -> (GenId, u8) {
        let h = self.header.lock();
        (h.active_gen_id, h.active_gen_index)
    }

    /// Mutex guarding chunk reinitialization for one owner bucket.
    pub fn bucket_lock(&self, owner: Handle) -> MutexGuard<'_, ()> {
        let small = self
            .config
            .mgmt_pools
            .get(MGMT_SMALL_POOL as usize)
            .map(|p| p.granule_size as u64)
            .unwrap_or(128);
        let idx = (owner.offset() / small) as usize % self.buckets.len();
        self.buckets[idx].lock()
    }

    fn slot_index(&self, gen_id: GenId) -> Option<usize> {
        (0..2).find(|&i| {
            self.slots[i]
                .read()
                .as_ref()
                .map(|g| g.id() == gen_id)
                .unwrap_or(false)
        })
    }

    pub fn is_resident(&self, gen_id: GenId) -> bool {
        gen_id == MGMT_GEN_ID || self.slot_index(gen_id).is_some()
    }

    /// Run `f` against a resident generation.
    pub fn with_gen<R>(&self, gen_id: GenId, f: impl FnOnce(&Generation) -> Result<R>) -> Result<R> {
        if gen_id == MGMT_GEN_ID {
            return f(&self.mgmt.read());
        }
        for slot in &self.slots {
            let guard = slot.read();
            if let Some(g) = guard.as_ref().filter(|g| g.id() == gen_id) {
                return f(g);
            }
        }
        Err(ProtocolError::InvalidHandle(Handle::new(gen_id, 0).raw()).into())
    }

    /// Run `f` against a resident generation with write access.
    pub fn with_gen_mut<R>(
        &self,
        gen_id: GenId,
        f: impl FnOnce(&mut Generation) -> Result<R>,
    ) -> Result<R> {
        if gen_id == MGMT_GEN_ID {
            return f(&mut self.mgmt.write());
        }
        for slot in &self.slots {
            let mut guard = slot.write();
            if let Some(g) = guard.as_mut().filter(|g| g.id() == gen_id) {
                return f(g);
            }
        }
        Err(ProtocolError::InvalidHandle(Handle::new(gen_id, 0).raw()).into())
    }

    /// Run `f` against the generation in a slot.
    pub fn with_slot<R>(&self, index: u8, f: impl FnOnce(Option<&Generation>) -> R) -> R {
        let guard = self.slots[index as usize & 1].read();
        f(guard.as_ref())
    }

    pub fn read(&self, handle: Handle, len: usize) -> Result<Vec<u8>> {
        self.with_gen(handle.gen_id(), |g| Ok(g.bytes(handle.offset(), len)?.to_vec()))
    }

    /// Write raw bytes at a handle and flush them.
    pub fn write(&self, handle: Handle, bytes: &[u8]) -> Result<()> {
        self.with_gen_mut(handle.gen_id(), |g| {
            g.bytes_mut(handle.offset(), bytes.len())?.copy_from_slice(bytes);
            Ok(())
        })?;
        self.flush(handle, bytes.len());
        Ok(())
    }

    pub fn flush(&self, handle: Handle, len: usize) {
        self.write_back.write_back(handle.gen_id(), handle.offset(), len);
    }

    /// Version of an owner record, from its split item.
    pub fn owner_version(&self, owner: Handle) -> Result<u32> {
        let data = self.read(owner.add(DESCRIPTOR_SIZE as u64), split_item::SIZE)?;
        Ok(split_item::version(&data))
    }

    /// Allocate a record in a resident generation.
    pub fn allocate(
        &self,
        gen_id: GenId,
        pool_id: u8,
        dtype: u16,
        attribute: u64,
        state: u64,
        payload: &[u8],
    ) -> Result<Handle> {
        let (handle, granules) = self.with_gen_mut(gen_id, |g| {
            let h = g.allocate(pool_id, dtype, attribute, state, payload)?;
            let size = g.pool(pool_id)?.granule_size as usize;
            Ok((h, g.chain(h.offset())?.len() * size))
        })?;
        self.flush(handle, granules);
        Ok(handle)
    }

    /// Allocate a zeroed chunk granule.
    pub fn allocate_chunk(&self, gen_id: GenId, pool_id: u8, dtype: u16) -> Result<Handle> {
        let handle = self.with_gen_mut(gen_id, |g| g.allocate_chunk(pool_id, dtype))?;
        let size = self.with_gen(gen_id, |g| Ok(g.pool(pool_id)?.granule_size as usize))?;
        self.flush(handle, size);
        Ok(handle)
    }

    /// Create an empty generation in a slot.
    pub fn create_generation(&self, index: u8, gen_id: GenId) -> Result<GenToken> {
        let index = index & 1;
        let gen = Generation::new(gen_id, self.config.gen_size, &self.config.gen_pools)?;
        let token = gen.token();
        self.install(index, gen)?;
        let mut header = self.header.lock();
        header.next_gen_id = header.next_gen_id.max(gen_id + 1);
        debug!(gen_id, index, "generation created");
        Ok(token)
    }

    /// Put a generation into a slot, replacing whatever was there.
    pub fn install(&self, index: u8, gen: Generation) -> Result<()> {
        let index = index & 1;
        let gen_id = gen.id();
        if gen_id == MGMT_GEN_ID {
            return Err(Error::Internal("management generation cannot occupy a slot".into()));
        }
        let mut entry = GenMapEntry::new(gen.token(), Some(index));
        entry.state = gen.state();
        {
            let mut header = self.header.lock();
            if let Some(old) = header.gen_map.get(&gen_id) {
                entry.disk_size = old.disk_size;
                entry.sync_state = old.sync_state;
                entry.sync_len = old.sync_len;
            }
            header.gen_map.insert(gen_id, entry);
            header.next_gen_id = header.next_gen_id.max(gen_id + 1);
        }
        let prev = self.slots[index as usize].write().replace(gen);
        if let Some(prev) = prev.filter(|p| p.id() != gen_id) {
            let mut header = self.header.lock();
            if let Some(e) = header.gen_map.get_mut(&prev.id()) {
                e.mem_index = None;
            }
        }
        Ok(())
    }

    /// Make a generation the active one.
    pub fn activate_generation(&self, gen_id: GenId, index: u8) -> Result<()> {
        self.set_gen_state(gen_id, GenState::Active)?;
        let mut header = self.header.lock();
        header.active_gen_id = gen_id;
        header.active_gen_index = index & 1;
        Ok(())
    }

    pub fn set_gen_state(&self, gen_id: GenId, state: GenState) -> Result<()> {
        if gen_id != MGMT_GEN_ID {
            self.with_gen_mut(gen_id, |g| {
                g.set_state(state);
                Ok(())
            })?;
        }
        if let Some(e) = self.header.lock().gen_map.get_mut(&gen_id) {
            e.state = state;
        }
        Ok(())
    }

    pub fn gen_state(&self, gen_id: GenId) -> Result<GenState> {
        self.with_gen(gen_id, |g| Ok(g.state()))
    }

    /// Drop a generation from memory after it reached disk.
    pub fn evict(&self, gen_id: GenId, disk_size: u64) -> Result<()> {
        let index = self
            .slot_index(gen_id)
            .ok_or_else(|| Error::Internal(format!("generation {} is not resident", gen_id)))?;
        self.slots[index].write().take();
        let mut header = self.header.lock();
        if let Some(e) = header.gen_map.get_mut(&gen_id) {
            e.state = GenState::WriteCompleted;
            e.disk_size = disk_size;
            e.mem_index = None;
        }
        Ok(())
    }

    /// Record the disk size of a generation.
    pub fn set_disk_size(&self, gen_id: GenId, disk_size: u64) {
        if let Some(e) = self.header.lock().gen_map.get_mut(&gen_id) {
            e.disk_size = disk_size;
        }
    }

    /// Forget a generation entirely.
    pub fn delete_generation(&self, gen_id: GenId) {
        if let Some(index) = self.slot_index(gen_id) {
            self.slots[index].write().take();
        }
        self.header.lock().gen_map.remove(&gen_id);
        self.recovery.lock().remove(&gen_id);
    }

    /// Remove the generation in a slot, keeping its map entry.
    pub fn take_slot(&self, index: u8) -> Option<Generation> {
        let gen = self.slots[index as usize & 1].write().take()?;
        if let Some(e) = self.header.lock().gen_map.get_mut(&gen.id()) {
            e.mem_index = None;
        }
        Some(gen)
    }

    /// Drop every data generation and reset the management generation.
    pub fn reset(&self) -> Result<()> {
        for slot in &self.slots {
            slot.write().take();
        }
        let mut mgmt = Generation::new(MGMT_GEN_ID, self.config.mgmt_size, &self.config.mgmt_pools)?;
        mgmt.set_state(GenState::Active);
        *self.mgmt.write() = mgmt;
        *self.header.lock() = MgmtHeader::fresh();
        info!("in-memory generations reset");
        Ok(())
    }

    /// Compacted image of a resident generation.
    pub fn compact(&self, gen_id: GenId) -> Result<Vec<u8>> {
        self.with_gen(gen_id, |g| g.compact())
    }

    /// Management header and compacted management generation.
    pub fn mgmt_image(&self) -> Result<Vec<u8>> {
        let image = MgmtImage {
            header: self.header_snapshot(),
            generation: self.mgmt.read().compact()?,
        };
        Ok(bincode::serialize(&image)?)
    }

    /// Replace the management generation and header from an image.
    pub fn load_mgmt_image(&self, image: &[u8]) -> Result<()> {
        let image: MgmtImage = bincode::deserialize(image)?;
        let gen = Generation::expand(&image.generation)?;
        if gen.id() != MGMT_GEN_ID {
            return Err(Error::malformed(format!("management image holds generation {}", gen.id())));
        }
        *self.mgmt.write() = gen;
        let mut header = image.header;
        for e in header.gen_map.values_mut() {
            e.mem_index = None;
        }
        *self.header.lock() = header;
        Ok(())
    }

    /// Keep a generation image read ahead during sync or recovery.
    pub fn add_recovery(&self, gen_id: GenId, image: Vec<u8>) {
        self.recovery.lock().insert(gen_id, Arc::new(image));
    }

    pub fn recovery_image(&self, gen_id: GenId) -> Option<Arc<Vec<u8>>> {
        self.recovery.lock().get(&gen_id).cloned()
    }

    pub fn take_recovery(&self, gen_id: GenId) -> Option<Arc<Vec<u8>>> {
        self.recovery.lock().remove(&gen_id)
    }

    pub fn recovery_ids(&self) -> Vec<GenId> {
        self.recovery.lock().keys().copied().collect()
    }

    /// Digest over the management header, management generation and resident
    /// data generations.
    pub fn fingerprint(&self) -> Result<u32> {
        let header = self.header_snapshot();
        let mut digest = CRC32.digest();
        digest.update(&header.active_gen_id.to_le_bytes());
        digest.update(&[header.active_gen_index]);
        for (gen_id, e) in &header.gen_map {
            digest.update(&gen_id.to_le_bytes());
            digest.update(&e.token.to_bytes());
            digest.update(&[e.state.as_u8()]);
        }
        digest.update(&self.mgmt.read().fingerprint().to_le_bytes());
        for slot in &self.slots {
            if let Some(g) = slot.read().as_ref() {
                digest.update(&g.fingerprint().to_le_bytes());
            }
        }
        Ok(digest.finalize())
    }

    /// Check the store's internal consistency.
    pub fn validate(&self) -> Result<()> {
        self.mgmt.read().validate()?;
        let header = self.header_snapshot();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(g) = slot.read().as_ref() {
                g.validate()?;
                let entry = header.gen_map.get(&g.id()).ok_or_else(|| {
                    Error::Internal(format!("resident generation {} missing from map", g.id()))
                })?;
                if entry.mem_index != Some(i as u8) {
                    return Err(Error::Internal(format!(
                        "generation {} is in slot {} but mapped to {:?}",
                        g.id(),
                        i,
                        entry.mem_index
                    )));
                }
            }
        }
        if header.active_gen_id != 0 {
            let active_here = self.with_slot(header.active_gen_index, |g| {
                g.map(|g| g.id() == header.active_gen_id).unwrap_or(false)
            });
            if !active_here {
                return Err(Error::Internal(format!(
                    "active generation {} not found in slot {}",
                    header.active_gen_id, header.active_gen_index
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::data_type;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingWriteBack(AtomicUsize);

    impl WriteBack for CountingWriteBack {
        fn write_back(&self, _gen_id: GenId, _offset: u64, len: usize) {
            self.0.fetch_add(len, Ordering::Relaxed);
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new(MemoryConfig::small(), Arc::new(NoWriteBack)).unwrap()
    }

    #[test]
    fn test_bootstrap_activates_first_generation() {
        let s = store();
        let gen_id = s.bootstrap().unwrap();
        assert_eq!(gen_id, FIRST_DATA_GEN_ID);
        assert_eq!(s.active(), (gen_id, 0));
        assert_eq!(s.gen_state(gen_id).unwrap(), GenState::Active);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_write_triggers_write_back() {
        let wb = Arc::new(CountingWriteBack::default());
        let s = MemoryStore::new(MemoryConfig::small(), wb.clone()).unwrap();
        let gen_id = s.bootstrap().unwrap();
        let h = s.allocate(gen_id, 0, data_type::USER_BASE, 0, 0, b"hello").unwrap();
        let before = wb.0.load(Ordering::Relaxed);
        s.write(h.add(DESCRIPTOR_SIZE as u64), b"HELLO").unwrap();
        assert_eq!(wb.0.load(Ordering::Relaxed), before + 5);
        assert_eq!(s.read(h.add(DESCRIPTOR_SIZE as u64), 5).unwrap(), b"HELLO");
    }

    #[test]
    fn test_unknown_generation_is_rejected() {
        let s = store();
        s.bootstrap().unwrap();
        assert!(s.read(Handle::new(99, 512), 8).is_err());
    }

    #[test]
    fn test_mgmt_image_round_trip() {
        let s = store();
        let gen_id = s.bootstrap().unwrap();
        let owner = s
            .allocate(MGMT_GEN_ID, 0, data_type::OWNER, 0, 0, &[0u8; split_item::SIZE])
            .unwrap();
        let image = s.mgmt_image().unwrap();

        let s2 = store();
        s2.load_mgmt_image(&image).unwrap();
        assert_eq!(s2.active().0, gen_id);
        assert_eq!(s2.owner_version(owner).unwrap(), 0);
        assert_eq!(s2.header().gen_map[&gen_id].mem_index, None);
    }

    #[test]
    fn test_evict_and_delete() {
        let s = store();
        let g1 = s.bootstrap().unwrap();
        s.create_generation(1, g1 + 1).unwrap();
        s.activate_generation(g1 + 1, 1).unwrap();
        s.evict(g1, 4096).unwrap();
        assert!(!s.is_resident(g1));
        assert_eq!(s.header().gen_map[&g1].disk_size, 4096);
        assert!(s.validate().is_ok());

        s.delete_generation(g1);
        assert!(!s.header().gen_map.contains_key(&g1));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let s = store();
        let gen_id = s.bootstrap().unwrap();
        let before = s.fingerprint().unwrap();
        s.allocate(gen_id, 1, data_type::USER_BASE, 0, 0, b"x").unwrap();
        assert_ne!(s.fingerprint().unwrap(), before);
    }

    #[test]
    fn test_sync_state_transitions() {
        let mut e = GenMapEntry::new(GenToken::generate(), None);
        assert!(e.set_sync_state(2, HaSyncState::Sent).is_err());
        e.set_sync_state(2, HaSyncState::Proposed).unwrap();
        e.set_sync_state(2, HaSyncState::Requested).unwrap();
        e.set_sync_state(2, HaSyncState::Available).unwrap();
        e.set_sync_state(2, HaSyncState::Sending).unwrap();
        e.set_sync_state(2, HaSyncState::Sent).unwrap();
    }
}
