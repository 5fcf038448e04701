// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Bridge between register areas and pub/sub topics
//!
//! Each configured data point becomes one [`GatewayObserver`] spanning the
//! point's cells. Modbus writes are decoded by the point's codec and
//! published to `<topic>/on`; payloads arriving on `<topic>` are packed back
//! into the point's cache region so subsequent reads see them.
//!
//! The bus itself stays behind the narrow [`PubSubClient`] trait; the
//! production implementation is [`redis::RedisPubSubClient`].

pub mod builder;
pub mod redis;

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};
use thiserror::Error;

use crate::codec::ValueCodec;
use crate::modbus::{
    CacheCells, CacheRegion, ReplyCode, ServerObserver, StoreKind, ValueCells,
};

pub use builder::build_gateway;
pub use self::redis::RedisPubSubClient;

/// Callback invoked with `(topic, payload)` for each received message.
pub type MessageHandler = Box<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("pub/sub client is closed")]
    Closed,
    #[error("pub/sub failure: {0}")]
    Backend(String),
}

/// Minimal pub/sub surface the gateway needs.
///
/// `publish` must not block the caller; implementations queue the message
/// and deliver it from their own task.
pub trait PubSubClient: Send + Sync {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), PubSubError>;

    /// Registers `handler` for messages on `topic`. Handlers run on the
    /// client's receive task and should only touch the shared cache briefly.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), PubSubError>;
}

/// Observer tying one bus topic to one register area.
pub struct GatewayObserver {
    topic: String,
    codec: Box<dyn ValueCodec>,
    client: Arc<dyn PubSubClient>,
    region: Mutex<Option<CacheRegion>>,
}

impl GatewayObserver {
    pub fn new(topic: &str, codec: Box<dyn ValueCodec>, client: Arc<dyn PubSubClient>) -> Self {
        Self {
            topic: topic.to_string(),
            codec,
            client,
            region: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Packs an incoming bus payload into the point's cache cells.
    ///
    /// Called from the pub/sub receive task; the cache mutex is the only
    /// state shared with the server loop.
    pub fn handle_message(&self, payload: &str) {
        let guard = self.lock_region();
        let region = match guard.as_ref() {
            Some(region) => region,
            None => {
                warn!("topic {}: message before cache allocation, dropped", self.topic);
                return;
            }
        };
        let result = if region.store.is_bit_store() {
            let mut cells = vec![0u8; self.codec.cell_count()];
            self.codec
                .pack(payload, &mut CacheCells::Bits(&mut cells))
                .map(|()| region.write_bits(&cells))
        } else {
            let mut cells = vec![0u16; self.codec.cell_count()];
            self.codec
                .pack(payload, &mut CacheCells::Words(&mut cells))
                .map(|()| region.write_words(&cells))
        };
        match result {
            Ok(Ok(())) => debug!("topic {}: stored payload {:?}", self.topic, payload),
            Ok(Err(e)) => warn!("topic {}: cache write failed: {}", self.topic, e),
            Err(e) => warn!("topic {}: cannot pack payload {:?}: {}", self.topic, payload, e),
        }
    }

    fn lock_region(&self) -> std::sync::MutexGuard<'_, Option<CacheRegion>> {
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Rebuilds the full cell image of the point, overlaying the freshly
    // written slice on the cached remainder so partial writes still decode.
    fn unpack_with_overlay(
        &self,
        region: &CacheRegion,
        start: i64,
        values: &ValueCells<'_>,
    ) -> Option<String> {
        let at = (start - region.offset) as usize;
        let text = if region.store.is_bit_store() {
            let mut cells = match region.read_bits() {
                Ok(cells) => cells,
                Err(e) => {
                    warn!("topic {}: cache read failed: {}", self.topic, e);
                    return None;
                }
            };
            if let ValueCells::Bits(bits) = values {
                cells[at..at + bits.len()].copy_from_slice(bits);
            }
            self.codec.unpack(&ValueCells::Bits(&cells))
        } else {
            let mut cells = match region.read_words() {
                Ok(cells) => cells,
                Err(e) => {
                    warn!("topic {}: cache read failed: {}", self.topic, e);
                    return None;
                }
            };
            if let ValueCells::Words(words) = values {
                cells[at..at + words.len()].copy_from_slice(words);
            }
            self.codec.unpack(&ValueCells::Words(&cells))
        };
        match text {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("topic {}: cannot decode written value: {}", self.topic, e);
                None
            }
        }
    }
}

impl ServerObserver for GatewayObserver {
    fn on_set_value(
        &self,
        _store: StoreKind,
        _slave_id: u8,
        start: i64,
        _count: usize,
        values: &ValueCells<'_>,
    ) -> ReplyCode {
        let guard = self.lock_region();
        let region = match guard.as_ref() {
            Some(region) => region,
            None => {
                warn!("topic {}: write before cache allocation", self.topic);
                return ReplyCode::ServerFailure;
            }
        };
        let payload = match self.unpack_with_overlay(region, start, values) {
            Some(payload) => payload,
            None => return ReplyCode::IllegalValue,
        };
        let reply_topic = format!("{}/on", self.topic);
        if let Err(e) = self.client.publish(&reply_topic, &payload) {
            warn!("topic {}: publish failed: {}", self.topic, e);
        }
        ReplyCode::Ok
    }

    fn on_cache_allocate(&self, _store: StoreKind, _slave_id: u8, regions: &[CacheRegion]) {
        if regions.len() > 1 {
            warn!(
                "topic {}: {} disjoint regions allocated, using the first",
                self.topic,
                regions.len()
            );
        }
        if let Some(region) = regions.first() {
            *self.lock_region() = Some(region.clone());
        }
    }
}
