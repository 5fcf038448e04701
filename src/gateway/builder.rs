// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration-time wiring of observers, codecs and subscriptions

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use log::info;

use crate::codec::{DiscreteCodec, FloatCodec, IntCodec, IntFormat, TextCodec, ValueCodec};
use crate::config::{PointConfig, RegisterFormat, RegistersConfig};
use crate::modbus::{ModbusServer, StoreKind};

use super::{GatewayObserver, PubSubClient};

/// Builds one codec and observer per enabled point, registers them with the
/// server and subscribes to their topics.
///
/// Fails when two points claim overlapping cells, when a point configuration
/// is incomplete, or when no point is enabled at all.
pub fn build_gateway(
    server: &mut ModbusServer,
    client: &Arc<dyn PubSubClient>,
    config: &RegistersConfig,
) -> Result<()> {
    let mut wired = 0usize;
    let stores = [
        (StoreKind::Coil, &config.coils),
        (StoreKind::DiscreteInput, &config.discretes),
        (StoreKind::HoldingRegister, &config.holdings),
        (StoreKind::InputRegister, &config.inputs),
    ];
    for (store, points) in stores {
        for point in points {
            if !point.enabled {
                continue;
            }
            let codec = make_codec(store, point)?;
            let count = codec.cell_count() as i64;
            let observer = Arc::new(GatewayObserver::new(
                &point.topic,
                codec,
                Arc::clone(client),
            ));
            server
                .observe(observer.clone(), store, point.address, count, point.unit_id)
                .map_err(|_| anyhow!("address overlapping: {}: topic {}", store, point.topic))?;
            let subscriber = Arc::clone(&observer);
            client
                .subscribe(
                    &point.topic,
                    Box::new(move |_topic, payload| subscriber.handle_message(payload)),
                )
                .map_err(|e| anyhow!("cannot subscribe to {}: {}", point.topic, e))?;
            info!(
                "wired {} topic {} to slave {} address {} ({} cells)",
                store, point.topic, point.unit_id, point.address, count
            );
            wired += 1;
        }
    }
    if wired == 0 {
        bail!("configuration defines no enabled data points");
    }
    Ok(())
}

fn make_codec(store: StoreKind, point: &PointConfig) -> Result<Box<dyn ValueCodec>> {
    if store.is_bit_store() {
        return Ok(Box::new(DiscreteCodec));
    }
    let codec: Box<dyn ValueCodec> = match point.format {
        RegisterFormat::Signed => Box::new(IntCodec::new(
            IntFormat::Signed,
            point.size.unwrap_or(2),
            point.scale,
            point.byteswap,
            point.wordswap,
        )),
        RegisterFormat::Unsigned => Box::new(IntCodec::new(
            IntFormat::Unsigned,
            point.size.unwrap_or(2),
            point.scale,
            point.byteswap,
            point.wordswap,
        )),
        RegisterFormat::Bcd => Box::new(IntCodec::new(
            IntFormat::Bcd,
            point.size.unwrap_or(2),
            point.scale,
            point.byteswap,
            point.wordswap,
        )),
        RegisterFormat::Float => Box::new(FloatCodec::new(
            point.size.unwrap_or(4),
            point.scale,
            point.byteswap,
            point.wordswap,
        )),
        RegisterFormat::Varchar => {
            let size = point
                .size
                .ok_or_else(|| anyhow!("varchar point {}: size is required", point.topic))?;
            Box::new(TextCodec::new(size, point.byteswap, point.wordswap))
        }
    };
    Ok(codec)
}
