//! The device we pretend to be on the bus: a three phase grid meter as
//! published by the Victron `dbus-cgwacs` service.

use crate::{
    attribute_store::{AttributeEntry, AttributeStore, Measurement},
    frame_decoder::MeasurementFrame,
};

pub const PRECISION: usize = 2;

const PHASES: [&str; 3] = ["L1", "L2", "L3"];

/// Static identity paths, written once at startup
fn identity_entries() -> Vec<(&'static str, AttributeEntry)> {
    vec![
        ("/Connected", AttributeEntry::new(1, "1")),
        ("/CustomName", AttributeEntry::new("Grid meter", "Grid meter")),
        ("/DeviceInstance", AttributeEntry::new(30, "30")),
        ("/DeviceType", AttributeEntry::new(71, "71")),
        ("/ErrorCode", AttributeEntry::new(0, "0")),
        ("/FirmwareVersion", AttributeEntry::new(2, "2")),
        ("/Mgmt/Connection", AttributeEntry::new("/dev/ttyUSB0", "/dev/ttyUSB0")),
        (
            "/Mgmt/ProcessName",
            AttributeEntry::new(
                "/opt/color-control/dbus-cgwacs/dbus-cgwacs",
                "/opt/color-control/dbus-cgwacs/dbus-cgwacs",
            ),
        ),
        ("/Mgmt/ProcessVersion", AttributeEntry::new("1.8.0", "1.8.0")),
        ("/Position", AttributeEntry::new(0, "0")),
        ("/ProductId", AttributeEntry::new(45058, "45058")),
        ("/ProductName", AttributeEntry::new("Grid meter", "Grid meter")),
        ("/Serial", AttributeEntry::new("BP98305081235", "BP98305081235")),
    ]
}

// Consumers refuse to start on non-numeric values, so every measurement path
// gets a numeric placeholder until the first frame arrives.
fn measurement_entries() -> Vec<(&'static str, AttributeEntry)> {
    let mut entries = vec![
        ("/Ac/Power", AttributeEntry::new(0.0, "0 W")),
        ("/Ac/Current", AttributeEntry::new(0.0, "0 A")),
        ("/Ac/Voltage", AttributeEntry::new(230, "230 V")),
        ("/Ac/Energy/Forward", AttributeEntry::new(0.0, "0 kWh")),
        ("/Ac/Energy/Reverse", AttributeEntry::new(0.0, "0 kWh")),
    ];
    for phase in 0..PHASES.len() {
        let paths = PhasePaths::of(phase);
        entries.extend([
            (paths.power, AttributeEntry::new(0.0, "0 W")),
            (paths.voltage, AttributeEntry::new(230, "230 V")),
            (paths.current, AttributeEntry::new(0.0, "0 A")),
            (paths.energy_forward, AttributeEntry::new(0.0, "0 kWh")),
            (paths.energy_reverse, AttributeEntry::new(0.0, "0 kWh")),
        ]);
    }
    entries
}

/// Every path the meter publishes, identity first
pub fn initial_entries() -> Vec<(&'static str, AttributeEntry)> {
    let mut entries = identity_entries();
    entries.extend(measurement_entries());
    entries
}

pub fn published_paths() -> Vec<&'static str> {
    initial_entries().into_iter().map(|(path, _)| path).collect()
}

/// Seeds `store` with the full device profile
pub fn initialize(store: &AttributeStore) {
    store.initialize(initial_entries());
}

struct PhasePaths {
    power: &'static str,
    voltage: &'static str,
    current: &'static str,
    energy_forward: &'static str,
    energy_reverse: &'static str,
}

impl PhasePaths {
    fn of(phase: usize) -> Self {
        match phase {
            0 => Self {
                power: "/Ac/L1/Power",
                voltage: "/Ac/L1/Voltage",
                current: "/Ac/L1/Current",
                energy_forward: "/Ac/L1/Energy/Forward",
                energy_reverse: "/Ac/L1/Energy/Reverse",
            },
            1 => Self {
                power: "/Ac/L2/Power",
                voltage: "/Ac/L2/Voltage",
                current: "/Ac/L2/Current",
                energy_forward: "/Ac/L2/Energy/Forward",
                energy_reverse: "/Ac/L2/Energy/Reverse",
            },
            _ => Self {
                power: "/Ac/L3/Power",
                voltage: "/Ac/L3/Voltage",
                current: "/Ac/L3/Current",
                energy_forward: "/Ac/L3/Energy/Forward",
                energy_reverse: "/Ac/L3/Energy/Reverse",
            },
        }
    }
}

fn measurement(path: &'static str, value: f64, unit: &'static str) -> Measurement {
    Measurement {
        path,
        value,
        unit,
        precision: PRECISION,
    }
}

/// Every published reading for one frame: the three phase aggregate followed
/// by each phase.
///
/// Power and energy totals come straight from the frame. Total current is the
/// sum of the phase currents and total voltage their mean.
pub fn measurements_for(frame: &MeasurementFrame) -> Vec<Measurement> {
    let total_current: f64 = frame.phases.iter().map(|p| p.current_amps).sum();
    let mean_voltage =
        frame.phases.iter().map(|p| p.voltage_volts).sum::<f64>() / frame.phases.len() as f64;

    let mut measurements = vec![
        measurement("/Ac/Power", frame.total_power_watts, "W"),
        measurement("/Ac/Current", total_current, "A"),
        measurement("/Ac/Voltage", mean_voltage, "V"),
        measurement("/Ac/Energy/Forward", frame.total_energy_imported_kwh, "kWh"),
        measurement("/Ac/Energy/Reverse", frame.total_energy_exported_kwh, "kWh"),
    ];

    for (index, phase) in frame.phases.iter().enumerate() {
        let paths = PhasePaths::of(index);
        measurements.extend([
            measurement(paths.power, phase.power_watts, "W"),
            measurement(paths.voltage, phase.voltage_volts, "V"),
            measurement(paths.current, phase.current_amps, "A"),
            measurement(paths.energy_forward, phase.energy_imported_kwh, "kWh"),
            measurement(paths.energy_reverse, phase.energy_exported_kwh, "kWh"),
        ]);
    }
    measurements
}

/// Logs the per phase table at debug level
pub fn log_phase_table(frame: &MeasurementFrame) {
    let [l1, l2, l3] = &frame.phases;
    tracing::debug!("+-----+-------------+---------------+---------------+");
    tracing::debug!("|value|   {}\t|     {}  \t|   {}  \t|", PHASES[0], PHASES[1], PHASES[2]);
    tracing::debug!("+-----+-------------+---------------+---------------+");
    tracing::debug!(
        "|  V  | {:8.2} \t| {:8.2} \t| {:8.2} \t|",
        l1.voltage_volts,
        l2.voltage_volts,
        l3.voltage_volts
    );
    tracing::debug!(
        "|  A  | {:8.2} \t| {:8.2} \t| {:8.2} \t|",
        l1.current_amps,
        l2.current_amps,
        l3.current_amps
    );
    tracing::debug!(
        "|  W  | {:8.2} \t| {:8.2} \t| {:8.2} \t|",
        l1.power_watts,
        l2.power_watts,
        l3.power_watts
    );
    tracing::debug!(
        "| kWh | {:8.2} \t| {:8.2} \t| {:8.2} \t|",
        l1.energy_imported_kwh,
        l2.energy_imported_kwh,
        l3.energy_imported_kwh
    );
    tracing::debug!(
        "| kWh | {:8.2} \t| {:8.2} \t| {:8.2} \t|",
        l1.energy_exported_kwh,
        l2.energy_exported_kwh,
        l3.energy_exported_kwh
    );
    tracing::debug!("+-----+-------------+---------------+---------------+");
}
