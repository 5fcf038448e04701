// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Redis-backed [`PubSubClient`]
//!
//! Two tasks run the bus side: a publisher draining an unbounded command
//! channel into `PUBLISH` commands, and a subscriber holding one pub/sub
//! connection for all registered topics. Both reconnect with a fixed delay
//! after a connection failure.
//!
//! Register all subscriptions before calling [`RedisPubSubClient::start`];
//! topics added later are only picked up after a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{MessageHandler, PubSubClient, PubSubError};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type HandlerMap = Arc<Mutex<HashMap<String, Vec<MessageHandler>>>>;

pub struct RedisPubSubClient {
    url: String,
    publish_tx: mpsc::UnboundedSender<(String, String)>,
    publish_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, String)>>>,
    handlers: HandlerMap,
}

impl RedisPubSubClient {
    pub fn new(url: &str) -> Self {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        Self {
            url: url.to_string(),
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawns the publisher and subscriber tasks and returns their handles.
    /// A second call returns an empty list.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let rx = self
            .publish_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let rx = match rx {
            Some(rx) => rx,
            None => {
                warn!("redis pub/sub client already started");
                return Vec::new();
            }
        };
        let mut tasks = vec![tokio::spawn(publisher_task(self.url.clone(), rx))];
        let topics: Vec<String> = {
            let guard = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.keys().cloned().collect()
        };
        if topics.is_empty() {
            debug!("no pub/sub subscriptions registered, subscriber task not started");
        } else {
            tasks.push(tokio::spawn(subscriber_task(
                self.url.clone(),
                topics,
                Arc::clone(&self.handlers),
            )));
        }
        tasks
    }
}

impl PubSubClient for RedisPubSubClient {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), PubSubError> {
        self.publish_tx
            .send((topic.to_string(), payload.to_string()))
            .map_err(|_| PubSubError::Closed)
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), PubSubError> {
        let mut guard = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        guard.entry(topic.to_string()).or_default().push(handler);
        Ok(())
    }
}

async fn publisher_task(url: String, mut rx: mpsc::UnboundedReceiver<(String, String)>) {
    let mut connection: Option<redis::aio::MultiplexedConnection> = None;
    while let Some((topic, payload)) = rx.recv().await {
        loop {
            if connection.is_none() {
                match connect(&url).await {
                    Ok(conn) => {
                        info!("redis publisher connected to {}", url);
                        connection = Some(conn);
                    }
                    Err(e) => {
                        warn!("redis connection to {} failed: {}", url, e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }
            let Some(conn) = connection.as_mut() else {
                continue;
            };
            let result: redis::RedisResult<()> = conn.publish(&topic, &payload).await;
            match result {
                Ok(()) => {
                    debug!("published {:?} to {}", payload, topic);
                    break;
                }
                Err(e) => {
                    warn!("publish to {} failed, reconnecting: {}", topic, e);
                    connection = None;
                }
            }
        }
    }
    debug!("redis publisher task finished");
}

async fn connect(url: &str) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
    let client = redis::Client::open(url)?;
    client.get_multiplexed_async_connection().await
}

async fn subscriber_task(url: String, topics: Vec<String>, handlers: HandlerMap) {
    loop {
        match receive_messages(&url, &topics, &handlers).await {
            Ok(()) => info!("redis subscription stream ended, reconnecting"),
            Err(e) => warn!("redis subscriber failure: {}", e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn receive_messages(
    url: &str,
    topics: &[String],
    handlers: &HandlerMap,
) -> redis::RedisResult<()> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    for topic in topics {
        pubsub.subscribe(topic).await?;
    }
    info!("subscribed to {} pub/sub topics on {}", topics.len(), url);
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let topic = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("undecodable payload on {}: {}", topic, e);
                continue;
            }
        };
        let guard = handlers.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.get(&topic) {
            Some(list) => {
                for handler in list {
                    handler(&topic, &payload);
                }
            }
            None => debug!("no handler for pub/sub topic {}", topic),
        }
    }
    Ok(())
}
