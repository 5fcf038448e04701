// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Protocol dispatcher
//!
//! [`ModbusServer`] keeps one [`AddressRange`] per store kind, with
//! addresses encoded as `(slave_id << 16) | local_address` so all slaves
//! share one map per store. Every request is resolved into the ordered
//! owner segments covering its span; owners are called in address order and
//! the first error verdict turns the whole request into an exception reply.
//!
//! The loop is single-task and cooperative: decode, owner callbacks, cache
//! mutation and replies all run synchronously inside [`loop_once`]
//! (`ModbusServer::loop_once`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::address_range::{AddressRange, OverlapError};

use super::backend::ModbusBackend;
use super::cache::{lock_cache, CacheRegion, StoreLimits};
use super::frame::{self, FrameError, ModbusQuery, Request};
use super::{CacheCells, ModbusError, Owner, ReplyCode, ServerObserver, StoreKind, ValueCells};

/// Bit width of the per-slave address window.
pub const SLAVE_ADDRESS_SHIFT: u32 = 16;

fn slave_offset(slave_id: u8) -> i64 {
    (slave_id as i64) << SLAVE_ADDRESS_SHIFT
}

#[derive(Default)]
struct StoreRanges {
    coils: AddressRange<Owner>,
    discrete_inputs: AddressRange<Owner>,
    holding_registers: AddressRange<Owner>,
    input_registers: AddressRange<Owner>,
}

impl StoreRanges {
    fn get(&self, store: StoreKind) -> &AddressRange<Owner> {
        match store {
            StoreKind::Coil => &self.coils,
            StoreKind::DiscreteInput => &self.discrete_inputs,
            StoreKind::HoldingRegister => &self.holding_registers,
            StoreKind::InputRegister => &self.input_registers,
        }
    }

    fn get_mut(&mut self, store: StoreKind) -> &mut AddressRange<Owner> {
        match store {
            StoreKind::Coil => &mut self.coils,
            StoreKind::DiscreteInput => &mut self.discrete_inputs,
            StoreKind::HoldingRegister => &mut self.holding_registers,
            StoreKind::InputRegister => &mut self.input_registers,
        }
    }
}

/// Modbus slave server routing requests to registered observers.
pub struct ModbusServer {
    backend: Box<dyn ModbusBackend>,
    ranges: StoreRanges,
    /// Per-slave cache high-water marks, keyed by slave id. Membership also
    /// means "this slave is observed".
    limits: BTreeMap<u8, StoreLimits>,
}

impl ModbusServer {
    pub fn new(backend: Box<dyn ModbusBackend>) -> Self {
        Self {
            backend,
            ranges: StoreRanges::default(),
            limits: BTreeMap::new(),
        }
    }

    /// Registers `observer` for `[start, start + count)` of `store` on
    /// `slave_id` and raises the slave's cache high-water mark.
    ///
    /// Fails when the span strictly overlaps cells owned by a different
    /// observer; adjacency and merging with the same observer are fine.
    pub fn observe(
        &mut self,
        observer: Arc<dyn ServerObserver>,
        store: StoreKind,
        start: i64,
        count: i64,
        slave_id: u8,
    ) -> Result<(), OverlapError> {
        let offset = slave_offset(slave_id);
        self.ranges
            .get_mut(store)
            .insert(offset + start, count, Owner::new(observer))?;
        self.limits
            .entry(slave_id)
            .or_default()
            .raise(store, start + count);
        debug!(
            "observing {} [{}, {}) on slave {}",
            store,
            start,
            start + count,
            slave_id
        );
        Ok(())
    }

    pub async fn listen(&mut self) -> Result<(), ModbusError> {
        self.backend.listen().await
    }

    /// Sizes the backend caches for every observed slave, then announces to
    /// each observer the regions it owns, grouped per `(store, slave)` and
    /// ordered by address.
    pub fn allocate_cache(&mut self) {
        for (&slave_id, limits) in &self.limits {
            self.backend.allocate_cache(slave_id, limits);
        }
        let cache = self.backend.shared_cache();
        let span = 1i64 << SLAVE_ADDRESS_SHIFT;
        for &slave_id in self.limits.keys() {
            let offset = slave_offset(slave_id);
            for store in StoreKind::ALL {
                let mut groups: Vec<(Owner, Vec<CacheRegion>)> = Vec::new();
                for (seg_start, seg_end, owner) in self.ranges.get(store).iter() {
                    let start = seg_start.max(offset);
                    let end = seg_end.min(offset + span);
                    if start >= end {
                        continue;
                    }
                    let region = CacheRegion::new(
                        Arc::clone(&cache),
                        store,
                        slave_id,
                        start - offset,
                        (end - start) as usize,
                    );
                    match groups.iter_mut().find(|group| &group.0 == owner) {
                        Some(group) => group.1.push(region),
                        None => groups.push((owner.clone(), vec![region])),
                    }
                }
                for (owner, regions) in groups {
                    owner.observer().on_cache_allocate(store, slave_id, &regions);
                }
            }
        }
    }

    /// One loop iteration: waits for transport activity, then drains and
    /// processes the query queue. Only fatal transport errors surface;
    /// protocol violations turn into exception replies.
    pub async fn loop_once(&mut self, timeout: Option<Duration>) -> Result<(), ModbusError> {
        self.backend.wait_for_messages(timeout).await?;
        while let Some(query) = self.backend.receive_query() {
            let slave_id = query.slave_id();
            if !self.limits.contains_key(&slave_id) {
                debug!("ignoring query for unobserved slave {}", slave_id);
                continue;
            }
            self.process_query(&query).await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        self.backend.close().await;
    }

    pub fn backend(&self) -> &dyn ModbusBackend {
        self.backend.as_ref()
    }

    async fn process_query(&mut self, query: &ModbusQuery) -> Result<(), ModbusError> {
        let request = match frame::parse_request(&query.data, query.header_length) {
            Ok(request) => request,
            Err(FrameError::UnsupportedFunction(function)) => {
                debug!("unsupported function code 0x{:02x}", function);
                return self
                    .backend
                    .reply_exception(ReplyCode::IllegalFunction, query)
                    .await;
            }
            Err(
                e @ (FrameError::BadCount { .. } | FrameError::BadByteCount | FrameError::BadValue),
            ) => {
                debug!("rejecting request: {}", e);
                return self
                    .backend
                    .reply_exception(ReplyCode::IllegalValue, query)
                    .await;
            }
            Err(e) => {
                warn!("dropping malformed query: {}", e);
                return Ok(());
            }
        };
        let store = match frame::store_for_function(request.function) {
            Some(store) => store,
            None => {
                return self
                    .backend
                    .reply_exception(ReplyCode::IllegalFunction, query)
                    .await;
            }
        };
        let code = if frame::is_write_function(request.function) {
            self.dispatch_write(query, &request, store)
        } else {
            self.dispatch_read(query, &request, store)
        };
        if code.is_error() {
            self.backend.reply_exception(code, query).await
        } else {
            self.backend.reply(query).await
        }
    }

    /// Lets every owner of the queried span refresh its cache cells before
    /// the backend echoes them.
    fn dispatch_read(&mut self, query: &ModbusQuery, request: &Request, store: StoreKind) -> ReplyCode {
        let slave_id = query.slave_id();
        let offset = slave_offset(slave_id);
        let segments = match self
            .ranges
            .get(store)
            .get_segments(offset + request.start as i64, request.count as i64)
        {
            Ok(segments) => segments,
            Err(e) => {
                debug!(
                    "read of {} [{}, +{}) on slave {}: {}",
                    store, request.start, request.count, slave_id, e
                );
                return ReplyCode::IllegalAddress;
            }
        };
        let cache = self.backend.shared_cache();
        let mut guard = lock_cache(&cache);
        for segment in segments {
            let start = segment.start - offset;
            let count = segment.count as usize;
            let code = if store.is_bit_store() {
                match guard.bits_mut(store, slave_id, start, count) {
                    Ok(cells) => segment.param.observer().on_get_value(
                        store,
                        slave_id,
                        start,
                        count,
                        &mut CacheCells::Bits(cells),
                    ),
                    Err(e) => {
                        warn!("cache lookup failed: {}", e);
                        return ReplyCode::ServerFailure;
                    }
                }
            } else {
                match guard.words_mut(store, slave_id, start, count) {
                    Ok(cells) => segment.param.observer().on_get_value(
                        store,
                        slave_id,
                        start,
                        count,
                        &mut CacheCells::Words(cells),
                    ),
                    Err(e) => {
                        warn!("cache lookup failed: {}", e);
                        return ReplyCode::ServerFailure;
                    }
                }
            };
            if code.is_error() {
                return code;
            }
        }
        ReplyCode::Ok
    }

    /// Decodes the write payload into native cells and offers each owner its
    /// slice; the backend applies the payload to the cache afterwards.
    fn dispatch_write(&mut self, query: &ModbusQuery, request: &Request, store: StoreKind) -> ReplyCode {
        let slave_id = query.slave_id();
        let offset = slave_offset(slave_id);
        let segments = match self
            .ranges
            .get(store)
            .get_segments(offset + request.start as i64, request.count as i64)
        {
            Ok(segments) => segments,
            Err(e) => {
                debug!(
                    "write to {} [{}, +{}) on slave {}: {}",
                    store, request.start, request.count, slave_id, e
                );
                return ReplyCode::IllegalAddress;
            }
        };
        let payload = &query.data[request.payload_offset..];
        let count = request.count as usize;
        let mut bit_values = Vec::new();
        let mut word_values = Vec::new();
        match request.function {
            frame::FC_WRITE_SINGLE_COIL => {
                bit_values.push(u8::from(payload[0] == 0xFF));
            }
            frame::FC_WRITE_MULTIPLE_COILS => {
                bit_values = frame::unpack_bits(payload, count);
            }
            _ => {
                word_values = frame::be_bytes_to_words(&payload[..count * 2]);
            }
        }
        let mut cursor = 0usize;
        for segment in segments {
            let start = segment.start - offset;
            let seg_count = segment.count as usize;
            let values = if store.is_bit_store() {
                ValueCells::Bits(&bit_values[cursor..cursor + seg_count])
            } else {
                ValueCells::Words(&word_values[cursor..cursor + seg_count])
            };
            let code =
                segment
                    .param
                    .observer()
                    .on_set_value(store, slave_id, start, seg_count, &values);
            cursor += seg_count;
            if code.is_error() {
                return code;
            }
        }
        ReplyCode::Ok
    }
}
