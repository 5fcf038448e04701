// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use modbus_gateway::gateway::{MessageHandler, PubSubClient, PubSubError};
use modbus_gateway::modbus::backend::BackendCore;
use modbus_gateway::modbus::{
    ModbusBackend, ModbusError, ModbusQuery, ReplyCode, SharedCache, StoreLimits,
};

/// In-memory backend: queries are pushed by the test, replies are collected
/// instead of being written to a socket.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

struct FakeState {
    core: BackendCore,
    replies: Vec<Vec<u8>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                core: BackendCore::new(),
                replies: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_query(&self, data: Vec<u8>, header_length: usize) {
        self.lock()
            .core
            .push_query(ModbusQuery::new(data, header_length, 0));
    }

    pub fn take_replies(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().replies)
    }

    pub fn cache(&self) -> SharedCache {
        self.lock().core.shared_cache()
    }
}

#[async_trait]
impl ModbusBackend for FakeBackend {
    fn set_slave(&mut self, slave: u8) {
        self.lock().core.set_slave(slave);
    }

    fn slave(&self) -> u8 {
        self.lock().core.slave()
    }

    async fn listen(&mut self) -> Result<(), ModbusError> {
        Ok(())
    }

    fn allocate_cache(&mut self, slave_id: u8, limits: &StoreLimits) {
        self.lock().core.allocate_cache(slave_id, limits);
    }

    fn shared_cache(&self) -> SharedCache {
        self.lock().core.shared_cache()
    }

    async fn wait_for_messages(
        &mut self,
        _timeout: Option<Duration>,
    ) -> Result<usize, ModbusError> {
        Ok(self.lock().core.available())
    }

    fn available(&self) -> usize {
        self.lock().core.available()
    }

    fn receive_query(&mut self) -> Option<ModbusQuery> {
        self.lock().core.pop_query()
    }

    async fn reply(&mut self, query: &ModbusQuery) -> Result<(), ModbusError> {
        let mut state = self.lock();
        if let Some(bytes) = state.core.build_response(query, query.slave_id())? {
            state.replies.push(bytes);
        }
        Ok(())
    }

    async fn reply_exception(
        &mut self,
        code: ReplyCode,
        query: &ModbusQuery,
    ) -> Result<(), ModbusError> {
        let mut state = self.lock();
        if let Some(bytes) = state.core.build_exception(query, code) {
            state.replies.push(bytes);
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Pub/sub double recording publishes and letting tests inject messages.
#[derive(Default)]
pub struct RecordingPubSub {
    published: Mutex<Vec<(String, String)>>,
    handlers: Mutex<HashMap<String, Vec<MessageHandler>>>,
}

impl RecordingPubSub {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Invokes the handlers registered for `topic`, like an incoming
    /// message would.
    pub fn deliver(&self, topic: &str, payload: &str) {
        let guard = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = guard.get(topic) {
            for handler in list {
                handler(topic, payload);
            }
        }
    }
}

impl PubSubClient for RecordingPubSub {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), PubSubError> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), PubSubError> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }
}
