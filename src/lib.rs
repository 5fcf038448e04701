// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus TCP/RTU slave gateway
//!
//! This crate exposes externally-defined data points (coils, discrete inputs,
//! holding and input registers) as a Modbus server and mirrors them onto
//! Redis pub/sub topics. Incoming Modbus writes are decoded, routed to the
//! observers registered for the addressed cells and published on the bus;
//! incoming bus messages are packed back into the register cache so that
//! subsequent Modbus reads return them.
//!
//! # Architecture
//!
//! ```text
//! Modbus master(s)                                    Redis
//!       │                                               │
//!       ▼                                               ▼
//! TcpBackend / RtuBackend ──► ModbusServer ──► GatewayObserver(s)
//!       │                         │                     │
//!       └────── RegisterCache ◄───┴── AddressRange ─────┘
//! ```
//!
//! * [`address_range`]: interval map partitioning the address space among
//!   observers;
//! * [`modbus`]: wire format, transport backends, register cache and the
//!   request dispatcher;
//! * [`codec`]: converters between register cells and bus payload strings;
//! * [`gateway`]: pub/sub client, bridge observers and configuration-time
//!   wiring;
//! * [`config`]: YAML configuration with JSON-schema validation;
//! * [`daemon`]: task supervision and shutdown.

pub mod address_range;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod gateway;
pub mod modbus;
