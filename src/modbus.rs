//! Modbus TCP transport for energy meters
//!
//! This module implements [`DeviceTransport`] for Modbus TCP meters with a
//! configurable input register layout. Voltage, current and power are read as
//! 32-bit floats; the lifetime energy counter is a 64-bit float in watt-hours.

use crate::config::ModbusParams;
use crate::error::{GridfluxError, Result};
use crate::transport::{DeviceTransport, MeasuredField, Measurement, TransportEvent};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

/// Modbus TCP meter transport
pub struct ModbusMeterTransport {
    /// Modbus connection context, present while connected
    ctx: Option<tokio_modbus::client::Context>,

    /// Connection parameters and register layout
    params: ModbusParams,

    /// Address resolved by `find`
    socket_addr: Option<std::net::SocketAddr>,

    /// Connection timeout
    connection_timeout: Duration,

    /// Per-read timeout
    operation_timeout: Duration,

    /// Event subscriber, if any
    events: Option<mpsc::UnboundedSender<TransportEvent>>,

    /// Logger
    logger: crate::logging::StructuredLogger,
}

impl ModbusMeterTransport {
    /// Create a new Modbus meter transport for the given device
    pub fn new(device_id: &str, params: &ModbusParams) -> Result<Self> {
        if params.address.is_empty() {
            return Err(GridfluxError::config(format!(
                "Device {} has an empty Modbus address",
                device_id
            )));
        }
        let logger = crate::logging::get_logger_with_context(
            crate::logging::LogContext::new("modbus").with_source(device_id.to_string()),
        );
        Ok(Self {
            ctx: None,
            params: params.clone(),
            socket_addr: None,
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
            events: None,
            logger,
        })
    }

    /// Whether a Modbus session is currently open
    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn get_ctx(&mut self) -> Result<&mut tokio_modbus::client::Context> {
        self.ctx
            .as_mut()
            .ok_or_else(|| GridfluxError::transport("Not connected to Modbus device"))
    }

    /// Read `count` input registers with the operation timeout applied
    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let timeout_duration = self.operation_timeout;

        self.logger.trace(&format!(
            "Reading {} registers from address {}",
            count, address
        ));

        let ctx = self.get_ctx()?;
        let request = ctx.read_input_registers(address, count);

        match timeout(timeout_duration, request).await {
            Ok(Ok(Ok(registers))) => Ok(registers),
            Ok(Ok(Err(exception))) => Err(GridfluxError::transport(format!(
                "Modbus exception reading address {}: {}",
                address, exception
            ))),
            Ok(Err(e)) => Err(GridfluxError::transport(format!(
                "Failed to read input registers: {}",
                e
            ))),
            Err(_) => Err(GridfluxError::timeout("Register read timeout")),
        }
    }

    async fn read_f32(&mut self, address: u16) -> Result<f64> {
        let regs = self.read_registers(address, 2).await?;
        Ok(decode_32bit_float(&regs)? as f64)
    }

    async fn read_f64(&mut self, address: u16) -> Result<f64> {
        let regs = self.read_registers(address, 4).await?;
        decode_64bit_float(&regs)
    }
}

#[async_trait]
impl DeviceTransport for ModbusMeterTransport {
    async fn find(&mut self) -> Result<()> {
        let addr: std::net::SocketAddr = self
            .params
            .address
            .parse()
            .map_err(|e| GridfluxError::transport(format!("Invalid socket address: {}", e)))?;
        self.socket_addr = Some(addr);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let addr = self
            .socket_addr
            .ok_or_else(|| GridfluxError::transport("No address resolved, find must run first"))?;

        self.logger
            .info(&format!("Connecting to Modbus device at {}", addr));

        let slave = Slave(self.params.unit_id);
        match timeout(self.connection_timeout, tcp::connect_slave(addr, slave)).await {
            Ok(Ok(ctx)) => {
                self.ctx = Some(ctx);
                self.logger.info("Successfully connected to Modbus device");
                self.emit(TransportEvent::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                let error_msg = format!("Failed to connect to Modbus device: {}", e);
                self.logger.error(&error_msg);
                Err(GridfluxError::transport(error_msg))
            }
            Err(_) => {
                let error_msg = "Connection timeout".to_string();
                self.logger.error(&error_msg);
                Err(GridfluxError::timeout(error_msg))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut ctx) = self.ctx.take() {
            self.logger.info("Disconnecting from Modbus device");
            if let Err(e) = ctx.disconnect().await {
                self.logger
                    .debug(&format!("Disconnect returned an error: {}", e));
            }
            self.emit(TransportEvent::Disconnected);
        }
        Ok(())
    }

    async fn refresh(&mut self, fields: &[MeasuredField]) -> Result<Measurement> {
        let mut measurement = Measurement::at(Utc::now());
        let registers = self.params.registers.clone();

        for field in fields {
            match field {
                MeasuredField::Voltage => {
                    if let Some(addr) = registers.voltage {
                        measurement.voltage = Some(self.read_f32(addr).await?);
                    }
                }
                MeasuredField::Current => {
                    if let Some(addr) = registers.current {
                        measurement.current = Some(self.read_f32(addr).await?);
                    }
                }
                MeasuredField::Power => {
                    if let Some(addr) = registers.power {
                        measurement.power_w = Some(self.read_f32(addr).await?);
                    }
                }
                MeasuredField::EnergyTotal => {
                    if let Some(addr) = registers.energy_total {
                        measurement.energy_total_wh = Some(self.read_f64(addr).await?);
                    }
                }
            }
        }

        Ok(measurement)
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }
}

/// Utility functions for register data conversion

/// Decode 32-bit float from two 16-bit registers (big-endian)
pub fn decode_32bit_float(registers: &[u16]) -> Result<f32> {
    if registers.len() < 2 {
        return Err(GridfluxError::transport(
            "Insufficient registers for 32-bit float",
        ));
    }

    let bytes = [
        (registers[0] >> 8) as u8,
        (registers[0] & 0xFF) as u8,
        (registers[1] >> 8) as u8,
        (registers[1] & 0xFF) as u8,
    ];

    Ok(f32::from_be_bytes(bytes))
}

/// Decode 64-bit float from four 16-bit registers (big-endian)
pub fn decode_64bit_float(registers: &[u16]) -> Result<f64> {
    if registers.len() < 4 {
        return Err(GridfluxError::transport(
            "Insufficient registers for 64-bit float",
        ));
    }

    let bytes = [
        (registers[0] >> 8) as u8,
        (registers[0] & 0xFF) as u8,
        (registers[1] >> 8) as u8,
        (registers[1] & 0xFF) as u8,
        (registers[2] >> 8) as u8,
        (registers[2] & 0xFF) as u8,
        (registers[3] >> 8) as u8,
        (registers[3] & 0xFF) as u8,
    ];

    Ok(f64::from_be_bytes(bytes))
}
