use thiserror::Error;

/// Anything shorter than this is not a full meter telegram
pub const MIN_FRAME_LEN: usize = 500;
/// Protocol id carried by meter updates (0x6069)
pub const METER_PROTOCOL_ID: u16 = 24681;
/// Serial reported by broadcast/discovery packets, never a real meter
pub const BROADCAST_SERIAL: u32 = 0xFFFF_FFFF;

const PROTOCOL_ID_OFFSET: usize = 16;
const SERIAL_OFFSET: usize = 20;
const UID_OFFSET: usize = 4;

const TOTAL_IMPORT_POWER_OFFSET: usize = 32;
const TOTAL_IMPORT_ENERGY_OFFSET: usize = 40;
const TOTAL_EXPORT_POWER_OFFSET: usize = 52;
const TOTAL_EXPORT_ENERGY_OFFSET: usize = 60;

const PHASE_BLOCK_LEN: usize = 144;
const PHASE_BLOCK_OFFSETS: [usize; 3] = [164, 308, 452];
/// End of the L3 block, the last byte the decoder touches
pub const FULL_FRAME_LEN: usize = 452 + PHASE_BLOCK_LEN;

// Offsets inside a phase block
const PHASE_IMPORT_POWER: usize = 4;
const PHASE_IMPORT_ENERGY: usize = 12;
const PHASE_EXPORT_POWER: usize = 24;
const PHASE_EXPORT_ENERGY: usize = 32;
const PHASE_VOLTAGE: usize = 132;

const WATT_SECONDS_PER_KWH: f64 = 3600.0 * 1000.0;

/// Why a datagram was not turned into a measurement frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("too short: {0} bytes")]
    TooShort(usize),
    #[error("wrong protocol/broadcast packet: protocol id {0:#06x}")]
    WrongProtocol(u16),
    #[error("implausible serial {0:#010x}")]
    ImplausibleSerial(u32),
    #[error("foreign meter: serial {actual}, listening for {expected}")]
    ForeignMeter { expected: u32, actual: u32 },
    #[error("truncated: {actual} bytes, phase data needs {needed}")]
    Truncated { needed: usize, actual: usize },
}

/// Per line-phase values
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseMeasurement {
    pub voltage_volts: f64,
    pub current_amps: f64,
    pub power_watts: f64,
    pub energy_imported_kwh: f64,
    pub energy_exported_kwh: f64,
}

/// One decoded meter telegram. Totals are read from the frame itself and are
/// not the sum of the phases.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementFrame {
    pub serial: u32,
    pub total_power_watts: f64,
    pub total_energy_imported_kwh: f64,
    pub total_energy_exported_kwh: f64,
    pub phases: [PhaseMeasurement; 3],
}

/// Validates and decodes a raw datagram.
///
/// Checks run cheapest first: length, protocol id, broadcast serial, then the
/// optional serial filter. `serial_filter` of `None` accepts any meter.
pub fn decode(datagram: &[u8], serial_filter: Option<u32>) -> Result<MeasurementFrame, DecodeError> {
    if datagram.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort(datagram.len()));
    }

    let protocol_id = read_u16(datagram, PROTOCOL_ID_OFFSET)?;
    if protocol_id != METER_PROTOCOL_ID {
        return Err(DecodeError::WrongProtocol(protocol_id));
    }

    let serial = read_u32(datagram, SERIAL_OFFSET)?;
    if serial == BROADCAST_SERIAL {
        return Err(DecodeError::ImplausibleSerial(serial));
    }

    if let Some(expected) = serial_filter {
        if expected != serial {
            return Err(DecodeError::ForeignMeter {
                expected,
                actual: serial,
            });
        }
    }

    if datagram.len() < FULL_FRAME_LEN {
        return Err(DecodeError::Truncated {
            needed: FULL_FRAME_LEN,
            actual: datagram.len(),
        });
    }

    tracing::debug!("Uid: {}", read_u32(datagram, UID_OFFSET)?);
    tracing::debug!("Serial: {serial}");

    let total_power_watts = net_power_watts(
        read_u32(datagram, TOTAL_IMPORT_POWER_OFFSET)?,
        read_u32(datagram, TOTAL_EXPORT_POWER_OFFSET)?,
    );
    let total_energy_imported_kwh = kwh(read_u64(datagram, TOTAL_IMPORT_ENERGY_OFFSET)?);
    let total_energy_exported_kwh = kwh(read_u64(datagram, TOTAL_EXPORT_ENERGY_OFFSET)?);

    let mut phases = [PhaseMeasurement::default(); 3];
    for (phase, offset) in phases.iter_mut().zip(PHASE_BLOCK_OFFSETS) {
        let block = datagram
            .get(offset..offset + PHASE_BLOCK_LEN)
            .ok_or(DecodeError::Truncated {
                needed: offset + PHASE_BLOCK_LEN,
                actual: datagram.len(),
            })?;
        *phase = decode_phase(block)?;
    }

    Ok(MeasurementFrame {
        serial,
        total_power_watts,
        total_energy_imported_kwh,
        total_energy_exported_kwh,
        phases,
    })
}

/// Decodes one 144 byte phase block
pub fn decode_phase(block: &[u8]) -> Result<PhaseMeasurement, DecodeError> {
    let power_watts = net_power_watts(
        read_u32(block, PHASE_IMPORT_POWER)?,
        read_u32(block, PHASE_EXPORT_POWER)?,
    );
    // millivolts on the wire
    let voltage_volts = f64::from(read_u32(block, PHASE_VOLTAGE)?) / 1000.0;

    Ok(PhaseMeasurement {
        voltage_volts,
        current_amps: current_amps(power_watts, voltage_volts),
        power_watts,
        energy_imported_kwh: kwh(read_u64(block, PHASE_IMPORT_ENERGY)?),
        energy_exported_kwh: kwh(read_u64(block, PHASE_EXPORT_ENERGY)?),
    })
}

/// Current is not transmitted. A disconnected phase reports 0 V, which yields 0 A.
pub fn current_amps(power_watts: f64, voltage_volts: f64) -> f64 {
    if voltage_volts == 0.0 {
        0.0
    } else {
        power_watts / voltage_volts
    }
}

/// Import and export are both in 0.1 W
fn net_power_watts(import_raw: u32, export_raw: u32) -> f64 {
    (f64::from(import_raw) - f64::from(export_raw)) / 10.0
}

fn kwh(watt_seconds: u64) -> f64 {
    watt_seconds as f64 / WATT_SECONDS_PER_KWH
}

fn field<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], DecodeError> {
    data.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::Truncated {
            needed: offset + N,
            actual: data.len(),
        })
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, DecodeError> {
    field(data, offset).map(u16::from_be_bytes)
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, DecodeError> {
    field(data, offset).map(u32::from_be_bytes)
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, DecodeError> {
    field(data, offset).map(u64::from_be_bytes)
}
