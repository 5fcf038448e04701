// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Multi-slave register cache
//!
//! One buffer per `(slave, store)` pair: bit stores keep one byte per point
//! (`0`/`1`), word stores one native `u16` per register. Values are
//! serialized big-endian only at the wire boundary.
//!
//! The cache is shared behind a mutex because pub/sub message handlers pack
//! incoming payloads into observer regions between server loop iterations.
//! All accessors take explicit `(offset, len)` pairs and fail on
//! out-of-range access.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use thiserror::Error;

use super::StoreKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("no {store} cache allocated for slave {slave_id}")]
    Unallocated { store: StoreKind, slave_id: u8 },
    #[error("{store} access out of range for slave {slave_id}: offset {offset}, len {len}, size {size}")]
    OutOfRange {
        store: StoreKind,
        slave_id: u8,
        offset: i64,
        len: usize,
        size: usize,
    },
}

/// Per-store high-water marks used to size a slave's buffers.
///
/// Each field is one past the highest observed address of that store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreLimits {
    pub coils: i64,
    pub discrete_inputs: i64,
    pub holding_registers: i64,
    pub input_registers: i64,
}

impl StoreLimits {
    pub fn get(&self, store: StoreKind) -> i64 {
        match store {
            StoreKind::Coil => self.coils,
            StoreKind::DiscreteInput => self.discrete_inputs,
            StoreKind::HoldingRegister => self.holding_registers,
            StoreKind::InputRegister => self.input_registers,
        }
    }

    /// Raises the mark for `store` to `end` if it is higher.
    pub fn raise(&mut self, store: StoreKind, end: i64) {
        let slot = match store {
            StoreKind::Coil => &mut self.coils,
            StoreKind::DiscreteInput => &mut self.discrete_inputs,
            StoreKind::HoldingRegister => &mut self.holding_registers,
            StoreKind::InputRegister => &mut self.input_registers,
        };
        if end > *slot {
            *slot = end;
        }
    }
}

/// Owned register buffers for all observed slaves.
#[derive(Debug, Default)]
pub struct RegisterCache {
    bits: HashMap<(u8, StoreKind), Vec<u8>>,
    words: HashMap<(u8, StoreKind), Vec<u16>>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes the buffers of `slave_id` to the given high-water marks.
    ///
    /// Calling this again for an already-sized slave keeps the existing
    /// buffers and their contents; the gateway does not resize caches at
    /// runtime.
    pub fn allocate(&mut self, slave_id: u8, limits: &StoreLimits) {
        if self.is_allocated(slave_id) {
            debug!(
                "cache for slave {} already sized, keeping existing buffers",
                slave_id
            );
            return;
        }
        for store in StoreKind::ALL {
            let size = limits.get(store);
            if size <= 0 {
                continue;
            }
            if store.is_bit_store() {
                self.bits.insert((slave_id, store), vec![0; size as usize]);
            } else {
                self.words.insert((slave_id, store), vec![0; size as usize]);
            }
        }
    }

    pub fn is_allocated(&self, slave_id: u8) -> bool {
        self.bits.keys().any(|k| k.0 == slave_id) || self.words.keys().any(|k| k.0 == slave_id)
    }

    pub fn bits(
        &self,
        store: StoreKind,
        slave_id: u8,
        offset: i64,
        len: usize,
    ) -> Result<&[u8], CacheError> {
        let buf = self
            .bits
            .get(&(slave_id, store))
            .ok_or(CacheError::Unallocated { store, slave_id })?;
        let range = slice_range(store, slave_id, offset, len, buf.len())?;
        Ok(&buf[range])
    }

    pub fn bits_mut(
        &mut self,
        store: StoreKind,
        slave_id: u8,
        offset: i64,
        len: usize,
    ) -> Result<&mut [u8], CacheError> {
        let buf = self
            .bits
            .get_mut(&(slave_id, store))
            .ok_or(CacheError::Unallocated { store, slave_id })?;
        let range = slice_range(store, slave_id, offset, len, buf.len())?;
        Ok(&mut buf[range])
    }

    pub fn words(
        &self,
        store: StoreKind,
        slave_id: u8,
        offset: i64,
        len: usize,
    ) -> Result<&[u16], CacheError> {
        let buf = self
            .words
            .get(&(slave_id, store))
            .ok_or(CacheError::Unallocated { store, slave_id })?;
        let range = slice_range(store, slave_id, offset, len, buf.len())?;
        Ok(&buf[range])
    }

    pub fn words_mut(
        &mut self,
        store: StoreKind,
        slave_id: u8,
        offset: i64,
        len: usize,
    ) -> Result<&mut [u16], CacheError> {
        let buf = self
            .words
            .get_mut(&(slave_id, store))
            .ok_or(CacheError::Unallocated { store, slave_id })?;
        let range = slice_range(store, slave_id, offset, len, buf.len())?;
        Ok(&mut buf[range])
    }
}

fn slice_range(
    store: StoreKind,
    slave_id: u8,
    offset: i64,
    len: usize,
    size: usize,
) -> Result<Range<usize>, CacheError> {
    let out_of_range = CacheError::OutOfRange {
        store,
        slave_id,
        offset,
        len,
        size,
    };
    if offset < 0 {
        return Err(out_of_range);
    }
    let start = offset as usize;
    let end = start.checked_add(len).ok_or(out_of_range.clone())?;
    if end > size {
        return Err(out_of_range);
    }
    Ok(start..end)
}

pub type SharedCache = Arc<Mutex<RegisterCache>>;

pub fn new_shared_cache() -> SharedCache {
    Arc::new(Mutex::new(RegisterCache::new()))
}

/// Locks the cache, recovering from a poisoned mutex.
pub fn lock_cache(cache: &SharedCache) -> MutexGuard<'_, RegisterCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one contiguous sub-range of the cache, handed to observers on
/// allocation so they can read and write their own cells later.
#[derive(Clone)]
pub struct CacheRegion {
    cache: SharedCache,
    pub store: StoreKind,
    pub slave_id: u8,
    pub offset: i64,
    pub len: usize,
}

impl CacheRegion {
    pub fn new(cache: SharedCache, store: StoreKind, slave_id: u8, offset: i64, len: usize) -> Self {
        Self {
            cache,
            store,
            slave_id,
            offset,
            len,
        }
    }

    pub fn read_bits(&self) -> Result<Vec<u8>, CacheError> {
        let guard = lock_cache(&self.cache);
        guard
            .bits(self.store, self.slave_id, self.offset, self.len)
            .map(<[u8]>::to_vec)
    }

    pub fn write_bits(&self, values: &[u8]) -> Result<(), CacheError> {
        let mut guard = lock_cache(&self.cache);
        let cells = guard.bits_mut(self.store, self.slave_id, self.offset, values.len().min(self.len))?;
        cells.copy_from_slice(&values[..cells.len()]);
        Ok(())
    }

    pub fn read_words(&self) -> Result<Vec<u16>, CacheError> {
        let guard = lock_cache(&self.cache);
        guard
            .words(self.store, self.slave_id, self.offset, self.len)
            .map(<[u16]>::to_vec)
    }

    pub fn write_words(&self, values: &[u16]) -> Result<(), CacheError> {
        let mut guard = lock_cache(&self.cache);
        let cells = guard.words_mut(self.store, self.slave_id, self.offset, values.len().min(self.len))?;
        cells.copy_from_slice(&values[..cells.len()]);
        Ok(())
    }
}

impl PartialEq for CacheRegion {
    fn eq(&self, other: &Self) -> bool {
        self.store == other.store
            && self.slave_id == other.slave_id
            && self.offset == other.offset
            && self.len == other.len
    }
}

// Keeps the shared cache out of the debug output.
impl fmt::Debug for CacheRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegion")
            .field("store", &self.store)
            .field("slave_id", &self.slave_id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
