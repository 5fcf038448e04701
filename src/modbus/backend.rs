// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Transport backends
//!
//! A backend owns the link to the Modbus masters, queues incoming queries
//! and builds replies from the register cache. Two implementations:
//!
//! * [`TcpBackend`]: a single-task multiplexer over a listener plus all
//!   accepted client connections. Each wait races `accept` against the
//!   readability of every connection; a client failure closes only that
//!   connection, a listener failure is fatal. Bytes accumulate per
//!   connection until they form complete MBAP frames.
//! * [`RtuBackend`]: one serial link. Bytes accumulate across reads until a
//!   whole ADU passes its CRC; an idle gap discards a stale partial frame.
//!   Replies switch the context slave id to the addressed slave and restore
//!   it afterwards.
//!
//! Reply construction lives in [`BackendCore`]: writes are applied to the
//! cache first and echoed, reads echo the cache contents. This is also what
//! test backends reuse.

use std::collections::VecDeque;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_all;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use super::cache::{lock_cache, new_shared_cache, SharedCache, StoreLimits};
use super::frame::{self, FrameError, ModbusQuery};
use super::{CacheError, ModbusError, ReplyCode};

/// Shared state and reply builder common to all backends.
pub struct BackendCore {
    cache: SharedCache,
    queue: VecDeque<ModbusQuery>,
    slave: u8,
}

impl Default for BackendCore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendCore {
    pub fn new() -> Self {
        Self {
            cache: new_shared_cache(),
            queue: VecDeque::new(),
            slave: 0,
        }
    }

    pub fn set_slave(&mut self, slave: u8) {
        self.slave = slave;
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn allocate_cache(&mut self, slave_id: u8, limits: &StoreLimits) {
        lock_cache(&self.cache).allocate(slave_id, limits);
    }

    pub fn shared_cache(&self) -> SharedCache {
        Arc::clone(&self.cache)
    }

    pub fn push_query(&mut self, query: ModbusQuery) {
        self.queue.push_back(query);
    }

    pub fn pop_query(&mut self) -> Option<ModbusQuery> {
        self.queue.pop_front()
    }

    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Builds the reply bytes for `query`, applying write payloads to the
    /// cache of `slave_id` and echoing reads from it.
    ///
    /// Malformed queries yield `None` (no reply); recoverable protocol
    /// violations yield an exception reply. An unallocated slave cache is a
    /// caller bug and surfaces as [`ModbusError::CacheMissing`].
    pub fn build_response(
        &self,
        query: &ModbusQuery,
        slave_id: u8,
    ) -> Result<Option<Vec<u8>>, ModbusError> {
        let request = match frame::parse_request(&query.data, query.header_length) {
            Ok(request) => request,
            Err(FrameError::UnsupportedFunction(_)) => {
                return Ok(Some(frame::build_exception_reply(query, 0x01)));
            }
            Err(
                FrameError::BadCount { .. } | FrameError::BadByteCount | FrameError::BadValue,
            ) => {
                return Ok(Some(frame::build_exception_reply(query, 0x03)));
            }
            Err(_) => return Ok(None),
        };
        // parse_request only accepts mapped function codes
        let store = match frame::store_for_function(request.function) {
            Some(store) => store,
            None => return Ok(None),
        };
        let mut cache = lock_cache(&self.cache);
        let start = request.start as i64;
        let count = request.count as usize;
        let result = match request.function {
            frame::FC_READ_COILS | frame::FC_READ_DISCRETE_INPUTS => cache
                .bits(store, slave_id, start, count)
                .map(|bits| frame::build_read_bits_reply(query, bits)),
            frame::FC_READ_HOLDING_REGISTERS | frame::FC_READ_INPUT_REGISTERS => cache
                .words(store, slave_id, start, count)
                .map(|words| frame::build_read_words_reply(query, words)),
            frame::FC_WRITE_SINGLE_COIL => {
                let value = u8::from(query.data[request.payload_offset] == 0xFF);
                cache.bits_mut(store, slave_id, start, 1).map(|cells| {
                    cells[0] = value;
                    frame::build_write_reply(query)
                })
            }
            frame::FC_WRITE_MULTIPLE_COILS => {
                let values =
                    frame::unpack_bits(&query.data[request.payload_offset..], count);
                cache.bits_mut(store, slave_id, start, count).map(|cells| {
                    cells.copy_from_slice(&values);
                    frame::build_write_reply(query)
                })
            }
            frame::FC_WRITE_SINGLE_REGISTER | frame::FC_WRITE_MULTIPLE_REGISTERS => {
                let payload =
                    &query.data[request.payload_offset..request.payload_offset + count * 2];
                let values = frame::be_bytes_to_words(payload);
                cache.words_mut(store, slave_id, start, count).map(|cells| {
                    cells.copy_from_slice(&values);
                    frame::build_write_reply(query)
                })
            }
            _ => return Ok(None),
        };
        match result {
            Ok(reply) => Ok(Some(reply)),
            Err(CacheError::OutOfRange { .. }) => {
                Ok(Some(frame::build_exception_reply(query, 0x02)))
            }
            Err(CacheError::Unallocated { .. }) => Err(ModbusError::CacheMissing(slave_id)),
        }
    }

    /// Builds an exception reply for `code`, `None` for the success codes.
    pub fn build_exception(&self, query: &ModbusQuery, code: ReplyCode) -> Option<Vec<u8>> {
        code.exception_code()
            .map(|exception| frame::build_exception_reply(query, exception))
    }
}

/// Transport abstraction driven by the server loop.
#[async_trait]
pub trait ModbusBackend: Send {
    /// Context slave id (RTU reply addressing).
    fn set_slave(&mut self, slave: u8);
    fn slave(&self) -> u8;

    /// Opens the listener or serial link.
    async fn listen(&mut self) -> Result<(), ModbusError>;

    /// Sizes the register cache of one slave. Safe to call repeatedly.
    fn allocate_cache(&mut self, slave_id: u8, limits: &StoreLimits);

    fn shared_cache(&self) -> SharedCache;

    /// Waits for link activity and queues any complete queries received.
    /// Returns the number of newly queued queries; `None` blocks until
    /// something happens. Interrupted waits return 0.
    async fn wait_for_messages(&mut self, timeout: Option<Duration>) -> Result<usize, ModbusError>;

    fn available(&self) -> usize;

    fn receive_query(&mut self) -> Option<ModbusQuery>;

    /// Builds the reply from the cache and sends it to the originator.
    async fn reply(&mut self, query: &ModbusQuery) -> Result<(), ModbusError>;

    /// Sends an exception reply for `code` (no-op for success codes).
    async fn reply_exception(
        &mut self,
        code: ReplyCode,
        query: &ModbusQuery,
    ) -> Result<(), ModbusError>;

    /// Releases the link. Further waits fail with [`ModbusError::NotListening`].
    async fn close(&mut self);
}

enum TcpReady {
    Accept(std::io::Result<(TcpStream, SocketAddr)>),
    Readable(usize, std::io::Result<()>),
}

struct TcpConnection {
    stream: TcpStream,
    // Bytes received so far that do not yet form a complete frame.
    inbox: Vec<u8>,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            inbox: Vec::new(),
        }
    }
}

/// Pops every complete MBAP frame off the head of `inbox`, leaving a partial
/// tail in place for the next read. A framing error empties the inbox, since
/// the stream position within the frame sequence is lost.
fn drain_mbap_frames(inbox: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    loop {
        match frame::mbap_frame_len(&inbox[offset..]) {
            Ok(Some(total)) => {
                frames.push(inbox[offset..offset + total].to_vec());
                offset += total;
            }
            Ok(None) => {
                inbox.drain(..offset);
                if !inbox.is_empty() {
                    debug!("holding {} bytes of partial frame", inbox.len());
                }
                break;
            }
            Err(e) => {
                warn!("dropping garbage from modbus client: {}", e);
                inbox.clear();
                break;
            }
        }
    }
    frames
}

/// Modbus TCP server backend multiplexing many client connections on one task.
pub struct TcpBackend {
    core: BackendCore,
    host: String,
    port: u16,
    listener: Option<TcpListener>,
    // Slot index doubles as the query connection id.
    connections: Vec<Option<TcpConnection>>,
}

impl TcpBackend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            core: BackendCore::new(),
            host: host.into(),
            port,
            listener: None,
            connections: Vec::new(),
        }
    }

    /// Bound listener address, available once listening. With a configured
    /// port of 0 this is the only way to learn the actual port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn store_connection(&mut self, stream: TcpStream) {
        let connection = TcpConnection::new(stream);
        match self.connections.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(connection),
            None => self.connections.push(Some(connection)),
        }
    }

    fn drop_connection(&mut self, id: usize) {
        if let Some(slot) = self.connections.get_mut(id) {
            *slot = None;
        }
    }

    /// Drains one readiness event worth of bytes into the connection's inbox
    /// and queues every complete frame accumulated so far.
    fn read_connection(&mut self, id: usize) -> usize {
        let frames = {
            let Some(conn) = self.connections.get_mut(id).and_then(Option::as_mut) else {
                return 0;
            };
            let mut buf = [0u8; 2 * frame::MAX_ADU_LEN];
            match conn.stream.try_read(&mut buf) {
                Ok(0) => {
                    info!("modbus client disconnected");
                    None
                }
                Ok(n) => {
                    conn.inbox.extend_from_slice(&buf[..n]);
                    Some(drain_mbap_frames(&mut conn.inbox))
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    return 0;
                }
                Err(e) => {
                    warn!("modbus client read failed: {}", e);
                    None
                }
            }
        };
        let Some(frames) = frames else {
            self.drop_connection(id);
            return 0;
        };
        let queued = frames.len();
        for data in frames {
            self.core
                .push_query(ModbusQuery::new(data, frame::MBAP_HEADER_LEN, id));
        }
        queued
    }

    async fn send(&mut self, id: usize, bytes: &[u8]) {
        let result = match self.connections.get_mut(id).and_then(Option::as_mut) {
            Some(conn) => conn.stream.write_all(bytes).await,
            None => {
                debug!("reply for a connection that is already gone");
                return;
            }
        };
        if let Err(e) = result {
            warn!("modbus client write failed: {}", e);
            self.drop_connection(id);
        }
    }
}

#[async_trait]
impl ModbusBackend for TcpBackend {
    fn set_slave(&mut self, slave: u8) {
        self.core.set_slave(slave);
    }

    fn slave(&self) -> u8 {
        self.core.slave()
    }

    async fn listen(&mut self) -> Result<(), ModbusError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!("modbus tcp server listening on {}:{}", self.host, self.port);
        self.listener = Some(listener);
        Ok(())
    }

    fn allocate_cache(&mut self, slave_id: u8, limits: &StoreLimits) {
        self.core.allocate_cache(slave_id, limits);
    }

    fn shared_cache(&self) -> SharedCache {
        self.core.shared_cache()
    }

    async fn wait_for_messages(&mut self, timeout: Option<Duration>) -> Result<usize, ModbusError> {
        let ready = {
            let Some(listener) = self.listener.as_ref() else {
                return Err(ModbusError::NotListening);
            };
            let mut pending: Vec<Pin<Box<dyn Future<Output = TcpReady> + Send + '_>>> =
                vec![Box::pin(async move { TcpReady::Accept(listener.accept().await) })];
            for (id, slot) in self.connections.iter().enumerate() {
                if let Some(conn) = slot {
                    pending.push(Box::pin(async move {
                        TcpReady::Readable(id, conn.stream.readable().await)
                    }));
                }
            }
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, select_all(pending)).await {
                    Ok((ready, _, _)) => ready,
                    Err(_) => return Ok(0),
                },
                None => select_all(pending).await.0,
            }
        };
        match ready {
            TcpReady::Accept(Ok((stream, peer))) => {
                info!("modbus client connected from {}", peer);
                self.store_connection(stream);
                Ok(0)
            }
            TcpReady::Accept(Err(e)) if e.kind() == ErrorKind::Interrupted => Ok(0),
            TcpReady::Accept(Err(e)) => {
                error!("modbus listener failure: {}", e);
                Err(ModbusError::Transport(e))
            }
            TcpReady::Readable(id, Ok(())) => Ok(self.read_connection(id)),
            TcpReady::Readable(_, Err(e)) if e.kind() == ErrorKind::Interrupted => Ok(0),
            TcpReady::Readable(id, Err(e)) => {
                warn!("modbus client wait failed: {}", e);
                self.drop_connection(id);
                Ok(0)
            }
        }
    }

    fn available(&self) -> usize {
        self.core.available()
    }

    fn receive_query(&mut self) -> Option<ModbusQuery> {
        self.core.pop_query()
    }

    async fn reply(&mut self, query: &ModbusQuery) -> Result<(), ModbusError> {
        if let Some(bytes) = self.core.build_response(query, query.slave_id())? {
            self.send(query.connection, &bytes).await;
        }
        Ok(())
    }

    async fn reply_exception(
        &mut self,
        code: ReplyCode,
        query: &ModbusQuery,
    ) -> Result<(), ModbusError> {
        if let Some(bytes) = self.core.build_exception(query, code) {
            self.send(query.connection, &bytes).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.listener = None;
        self.connections.clear();
        info!("modbus tcp backend closed");
    }
}

/// Modbus RTU server backend over a single serial link.
pub struct RtuBackend {
    core: BackendCore,
    path: String,
    baud_rate: u32,
    parity: Parity,
    data_bits: DataBits,
    stop_bits: StopBits,
    port: Option<SerialStream>,
    // Bytes received so far that do not yet form a complete frame.
    inbox: Vec<u8>,
}

impl RtuBackend {
    /// `parity` is the usual single-letter convention (`N`, `E`, `O`).
    pub fn new(
        path: impl Into<String>,
        baud_rate: u32,
        parity: char,
        data_bits: u8,
        stop_bits: u8,
    ) -> Result<Self, ModbusError> {
        let parity = match parity.to_ascii_uppercase() {
            'N' => Parity::None,
            'E' => Parity::Even,
            'O' => Parity::Odd,
            other => return Err(invalid_setting(format!("unknown parity {:?}", other))),
        };
        let data_bits = match data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => return Err(invalid_setting(format!("unsupported data bits {}", other))),
        };
        let stop_bits = match stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => return Err(invalid_setting(format!("unsupported stop bits {}", other))),
        };
        Ok(Self {
            core: BackendCore::new(),
            path: path.into(),
            baud_rate,
            parity,
            data_bits,
            stop_bits,
            port: None,
            inbox: Vec::new(),
        })
    }

    /// Queues every complete frame at the head of the inbox. CRC failure or
    /// an unframeable byte sequence clears the inbox; the line resynchronizes
    /// on the next idle gap.
    fn drain_rtu_frames(&mut self) -> usize {
        let mut queued = 0;
        loop {
            match frame::rtu_frame_len(&self.inbox) {
                Ok(Some(total)) => {
                    let framed: Vec<u8> = self.inbox.drain(..total).collect();
                    match frame::rtu_check(&framed) {
                        Ok(adu) => {
                            self.core.push_query(ModbusQuery::new(
                                adu.to_vec(),
                                frame::RTU_HEADER_LEN,
                                0,
                            ));
                            queued += 1;
                        }
                        Err(e) => {
                            warn!("dropping rtu frame: {}", e);
                            self.inbox.clear();
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("dropping rtu garbage: {}", e);
                    self.inbox.clear();
                    break;
                }
            }
        }
        queued
    }
}

fn invalid_setting(message: String) -> ModbusError {
    ModbusError::Transport(std::io::Error::new(ErrorKind::InvalidInput, message))
}

#[async_trait]
impl ModbusBackend for RtuBackend {
    fn set_slave(&mut self, slave: u8) {
        self.core.set_slave(slave);
    }

    fn slave(&self) -> u8 {
        self.core.slave()
    }

    async fn listen(&mut self) -> Result<(), ModbusError> {
        let builder = tokio_serial::new(&self.path, self.baud_rate)
            .parity(self.parity)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits);
        let port = builder
            .open_native_async()
            .map_err(|e| ModbusError::Transport(std::io::Error::new(ErrorKind::Other, e)))?;
        info!(
            "modbus rtu server listening on {} at {} baud",
            self.path, self.baud_rate
        );
        self.port = Some(port);
        Ok(())
    }

    fn allocate_cache(&mut self, slave_id: u8, limits: &StoreLimits) {
        self.core.allocate_cache(slave_id, limits);
    }

    fn shared_cache(&self) -> SharedCache {
        self.core.shared_cache()
    }

    async fn wait_for_messages(&mut self, timeout: Option<Duration>) -> Result<usize, ModbusError> {
        let Some(port) = self.port.as_mut() else {
            return Err(ModbusError::NotListening);
        };
        let mut buf = [0u8; frame::MAX_ADU_LEN];
        let read = match timeout {
            Some(limit) => match tokio::time::timeout(limit, port.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    // The line went idle; a frame split across that gap is dead.
                    if !self.inbox.is_empty() {
                        debug!("dropping {} bytes on idle serial line", self.inbox.len());
                        self.inbox.clear();
                    }
                    return Ok(0);
                }
            },
            None => port.read(&mut buf).await,
        };
        match read {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.inbox.extend_from_slice(&buf[..n]);
                Ok(self.drain_rtu_frames())
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                error!("serial link failure: {}", e);
                Err(ModbusError::Transport(e))
            }
        }
    }

    fn available(&self) -> usize {
        self.core.available()
    }

    fn receive_query(&mut self) -> Option<ModbusQuery> {
        self.core.pop_query()
    }

    async fn reply(&mut self, query: &ModbusQuery) -> Result<(), ModbusError> {
        // Address the reply as the slave the master asked for, then restore
        // the context slave id.
        let previous = self.core.slave();
        self.core.set_slave(query.slave_id());
        let response = self.core.build_response(query, self.core.slave());
        self.core.set_slave(previous);

        let Some(bytes) = response? else { return Ok(()) };
        // Broadcasts get no reply.
        if query.slave_id() == 0 {
            return Ok(());
        }
        let Some(port) = self.port.as_mut() else {
            return Err(ModbusError::NotListening);
        };
        port.write_all(&frame::rtu_frame(&bytes)).await?;
        Ok(())
    }

    async fn reply_exception(
        &mut self,
        code: ReplyCode,
        query: &ModbusQuery,
    ) -> Result<(), ModbusError> {
        let Some(bytes) = self.core.build_exception(query, code) else {
            return Ok(());
        };
        if query.slave_id() == 0 {
            return Ok(());
        }
        let Some(port) = self.port.as_mut() else {
            return Err(ModbusError::NotListening);
        };
        port.write_all(&frame::rtu_frame(&bytes)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.port = None;
        info!("modbus rtu backend closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::frame::MBAP_HEADER_LEN;
    use crate::modbus::StoreKind;

    fn core_with_cache() -> BackendCore {
        let mut core = BackendCore::new();
        core.allocate_cache(
            1,
            &StoreLimits {
                coils: 16,
                discrete_inputs: 0,
                holding_registers: 8,
                input_registers: 0,
            },
        );
        core
    }

    #[test]
    fn write_applies_to_cache_and_echoes() {
        let core = core_with_cache();
        let query = ModbusQuery::new(
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0x00, 0x02, 0x00, 0x02, 0x04,
                 0x12, 0x34, 0x56, 0x78],
            MBAP_HEADER_LEN,
            0,
        );
        let reply = core.build_response(&query, 1).unwrap().unwrap();
        assert_eq!(
            reply,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x10, 0x00, 0x02, 0x00, 0x02]
        );
        let cache = core.shared_cache();
        assert_eq!(
            lock_cache(&cache)
                .words(StoreKind::HoldingRegister, 1, 2, 2)
                .unwrap(),
            &[0x1234, 0x5678]
        );
    }

    #[test]
    fn read_echoes_cache_contents() {
        let core = core_with_cache();
        {
            let cache = core.shared_cache();
            lock_cache(&cache)
                .bits_mut(StoreKind::Coil, 1, 0, 3)
                .unwrap()
                .copy_from_slice(&[1, 0, 1]);
        }
        let query = ModbusQuery::new(vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x03], 1, 0);
        let reply = core.build_response(&query, 1).unwrap().unwrap();
        assert_eq!(reply, vec![0x01, 0x01, 0x01, 0x05]);
    }

    #[test]
    fn out_of_range_request_is_an_illegal_address_exception() {
        let core = core_with_cache();
        let query = ModbusQuery::new(vec![0x01, 0x03, 0x00, 0x06, 0x00, 0x05], 1, 0);
        let reply = core.build_response(&query, 1).unwrap().unwrap();
        assert_eq!(reply, vec![0x01, 0x83, 0x02]);
    }

    #[test]
    fn unallocated_slave_is_a_hard_error() {
        let core = core_with_cache();
        let query = ModbusQuery::new(vec![0x09, 0x03, 0x00, 0x00, 0x00, 0x01], 1, 0);
        assert!(matches!(
            core.build_response(&query, 9),
            Err(ModbusError::CacheMissing(9))
        ));
    }

    #[test]
    fn unsupported_function_is_an_exception_reply() {
        let core = core_with_cache();
        let query = ModbusQuery::new(vec![0x01, 0x2B, 0x00, 0x00, 0x00, 0x01], 1, 0);
        let reply = core.build_response(&query, 1).unwrap().unwrap();
        assert_eq!(reply, vec![0x01, 0xAB, 0x01]);
    }

    #[test]
    fn split_mbap_frame_survives_in_the_inbox() {
        let adu = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let mut inbox = adu[..5].to_vec();
        assert!(drain_mbap_frames(&mut inbox).is_empty());
        assert_eq!(inbox.len(), 5);
        inbox.extend_from_slice(&adu[5..]);
        assert_eq!(drain_mbap_frames(&mut inbox), vec![adu.to_vec()]);
        assert!(inbox.is_empty());
    }

    #[test]
    fn back_to_back_mbap_frames_leave_the_partial_tail() {
        let adu = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let mut inbox = adu.to_vec();
        inbox.extend_from_slice(&adu);
        inbox.extend_from_slice(&adu[..4]);
        let frames = drain_mbap_frames(&mut inbox);
        assert_eq!(frames.len(), 2);
        assert_eq!(inbox, adu[..4].to_vec());
    }

    #[test]
    fn mbap_garbage_empties_the_inbox() {
        // Nonzero protocol id.
        let mut inbox = vec![0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03];
        assert!(drain_mbap_frames(&mut inbox).is_empty());
        assert!(inbox.is_empty());
    }

    #[tokio::test]
    async fn split_tcp_request_is_queued_once_complete() {
        let mut backend = TcpBackend::new("127.0.0.1", 0);
        backend.listen().await.unwrap();
        backend.allocate_cache(
            1,
            &StoreLimits {
                coils: 0,
                discrete_inputs: 0,
                holding_registers: 8,
                input_registers: 0,
            },
        );
        let addr = backend.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();

        let adu = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        client.write_all(&adu[..5]).await.unwrap();
        // Accept the connection and drain the first fragment; it must not
        // produce a query on its own.
        for _ in 0..10 {
            let queued = backend
                .wait_for_messages(Some(Duration::from_millis(50)))
                .await
                .unwrap();
            assert_eq!(queued, 0);
        }

        client.write_all(&adu[5..]).await.unwrap();
        let mut queued = 0;
        for _ in 0..20 {
            queued = backend
                .wait_for_messages(Some(Duration::from_millis(100)))
                .await
                .unwrap();
            if queued > 0 {
                break;
            }
        }
        assert_eq!(queued, 1);
        let query = backend.receive_query().unwrap();
        assert_eq!(query.data, adu.to_vec());
        assert_eq!(query.slave_id(), 1);
    }

    #[test]
    fn split_rtu_frame_accumulates_across_reads() {
        let mut backend = RtuBackend::new("/dev/ttyUSB0", 9600, 'N', 8, 1).unwrap();
        backend.allocate_cache(
            1,
            &StoreLimits {
                coils: 0,
                discrete_inputs: 0,
                holding_registers: 8,
                input_registers: 0,
            },
        );
        let framed = frame::rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        backend.inbox.extend_from_slice(&framed[..3]);
        assert_eq!(backend.drain_rtu_frames(), 0);
        backend.inbox.extend_from_slice(&framed[3..]);
        assert_eq!(backend.drain_rtu_frames(), 1);
        let query = backend.receive_query().unwrap();
        assert_eq!(query.slave_id(), 1);
        assert_eq!(query.function(), 0x03);
    }

    #[test]
    fn rtu_garbage_clears_the_inbox() {
        let mut backend = RtuBackend::new("/dev/ttyUSB0", 9600, 'N', 8, 1).unwrap();
        backend.inbox.extend_from_slice(&[0x01, 0x2B, 0x00]);
        assert_eq!(backend.drain_rtu_frames(), 0);
        assert!(backend.inbox.is_empty());

        // A corrupted CRC drops the whole buffer too.
        let mut framed = frame::rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        framed[2] ^= 0xFF;
        backend.inbox.extend_from_slice(&framed);
        assert_eq!(backend.drain_rtu_frames(), 0);
        assert!(backend.inbox.is_empty());
    }
}
