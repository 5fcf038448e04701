// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus server core: stores, observers, wire format, transports, dispatcher
//!
//! The pieces fit together as follows: a transport backend ([`backend`])
//! queues raw queries and answers them from the register cache ([`cache`]);
//! the dispatcher ([`server`]) decodes each query ([`frame`]) and routes it
//! to the [`ServerObserver`]s registered for the addressed cells.

pub mod backend;
pub mod cache;
pub mod frame;
pub mod server;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use backend::{ModbusBackend, RtuBackend, TcpBackend};
pub use cache::{CacheError, CacheRegion, RegisterCache, SharedCache, StoreLimits};
pub use frame::ModbusQuery;
pub use server::ModbusServer;

/// The four Modbus data stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl StoreKind {
    pub const ALL: [StoreKind; 4] = [
        StoreKind::Coil,
        StoreKind::DiscreteInput,
        StoreKind::InputRegister,
        StoreKind::HoldingRegister,
    ];

    /// Coils and discrete inputs hold single bits; the other stores hold
    /// 16-bit registers.
    pub fn is_bit_store(self) -> bool {
        matches!(self, StoreKind::Coil | StoreKind::DiscreteInput)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreKind::Coil => "coils",
            StoreKind::DiscreteInput => "discrete inputs",
            StoreKind::InputRegister => "input registers",
            StoreKind::HoldingRegister => "holding registers",
        };
        f.write_str(name)
    }
}

/// Observer verdict for a single owner segment.
///
/// `Cached` and `Ok` let the request proceed; the remaining variants map to
/// Modbus exception responses and stop the segment walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    /// The cache already holds the value, nothing to refresh.
    Cached,
    Ok,
    IllegalFunction,
    IllegalAddress,
    IllegalValue,
    ServerFailure,
}

impl ReplyCode {
    /// Modbus exception code carried by the error variants.
    pub fn exception_code(self) -> Option<u8> {
        match self {
            ReplyCode::Cached | ReplyCode::Ok => None,
            ReplyCode::IllegalFunction => Some(0x01),
            ReplyCode::IllegalAddress => Some(0x02),
            ReplyCode::IllegalValue => Some(0x03),
            ReplyCode::ServerFailure => Some(0x04),
        }
    }

    pub fn is_error(self) -> bool {
        self.exception_code().is_some()
    }
}

/// Mutable view into the cache cells backing a request segment.
pub enum CacheCells<'a> {
    Bits(&'a mut [u8]),
    Words(&'a mut [u16]),
}

impl CacheCells<'_> {
    pub fn len(&self) -> usize {
        match self {
            CacheCells::Bits(b) => b.len(),
            CacheCells::Words(w) => w.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded native values carried by a write request segment: `0`/`1` per bit
/// cell, one `u16` per register cell.
pub enum ValueCells<'a> {
    Bits(&'a [u8]),
    Words(&'a [u16]),
}

impl ValueCells<'_> {
    pub fn len(&self) -> usize {
        match self {
            ValueCells::Bits(b) => b.len(),
            ValueCells::Words(w) => w.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handler for the register cells of one address span.
///
/// All methods have defaults so an observer only implements what it needs:
/// reads are served from the cache, writes are accepted silently and cache
/// allocation is ignored.
///
/// Callbacks run synchronously on the server loop; a blocking observer
/// stalls the whole gateway.
pub trait ServerObserver: Send + Sync {
    /// Called before a read reply is built. The observer may refresh the
    /// cache cells in place; returning [`ReplyCode::Cached`] keeps them as
    /// they are.
    ///
    /// The dispatcher holds the register cache lock while this runs: the
    /// passed cells are the only cache access allowed here, and calling a
    /// [`CacheRegion`] accessor from this callback deadlocks.
    fn on_get_value(
        &self,
        _store: StoreKind,
        _slave_id: u8,
        _start: i64,
        _count: usize,
        _cache: &mut CacheCells<'_>,
    ) -> ReplyCode {
        ReplyCode::Cached
    }

    /// Called with the decoded values of a write request before they are
    /// applied to the cache. Returning an error variant turns the whole
    /// request into an exception reply.
    fn on_set_value(
        &self,
        _store: StoreKind,
        _slave_id: u8,
        _start: i64,
        _count: usize,
        _values: &ValueCells<'_>,
    ) -> ReplyCode {
        ReplyCode::Ok
    }

    /// Called once per `(store, slave)` after cache allocation with the
    /// regions this observer owns, in address order.
    fn on_cache_allocate(&self, _store: StoreKind, _slave_id: u8, _regions: &[CacheRegion]) {}
}

/// Observer handle stored in the address-range maps.
///
/// Equality is pointer identity: two handles are equal only when they wrap
/// the same observer instance, which is what segment merging must key on.
#[derive(Clone)]
pub struct Owner(Arc<dyn ServerObserver>);

impl Owner {
    pub fn new(observer: Arc<dyn ServerObserver>) -> Self {
        Self(observer)
    }

    pub fn observer(&self) -> &Arc<dyn ServerObserver> {
        &self.0
    }
}

impl PartialEq for Owner {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner({:p})", Arc::as_ptr(&self.0))
    }
}

/// Transport and dispatch failures.
///
/// Only `Transport`, `NotListening` and `Closed` are fatal to the server
/// loop; per-connection errors are handled inside the backends.
#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
    #[error("no register cache allocated for slave {0}")]
    CacheMissing(u8),
    #[error("backend is not listening")]
    NotListening,
    #[error("backend is closed")]
    Closed,
    #[error(transparent)]
    Cache(#[from] CacheError),
}
