//! Desktop simulator for the solarpath node.
//!
//! Runs the duty cycle against simulated hardware: a solar panel following a
//! day curve, a battery charging from it, the two I2C climate sensors and a
//! logging LED driver. Scheduled downlinks exercise manual, auto and disabled
//! LED modes plus a device class request. Every uplink is logged as hex and
//! decoded back into physical units.
//!
//! Simulated time is accelerated: each duty cycle advances the clock by
//! [`MINUTES_PER_CYCLE`].
//!
//! ```text
//! solarpath-simulator [cycles]
//! ```
//!
//! Log level defaults to `info`; set `RUST_LOG=debug` for per-strip traffic.

use std::cell::RefCell;
use std::convert::Infallible;
use std::f64::consts::PI;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal::i2c::{self, I2c, NoAcknowledgeSource, Operation, SevenBitAddress};
use log::{debug, error, info};

use solarpath::actuator::{LedDriver, Rgb};
use solarpath::codec::{ControlFrame, TelemetryFrame, expand_channel};
use solarpath::config::{AdcConfig, RadioConfig};
use solarpath::sensors::{AT30TS01_ADDRESS, AdcReader, ENS210_ADDRESS, SensorHub};
use solarpath::{System, SystemConfig};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Duty cycles run when no count is given: two simulated days.
const DEFAULT_CYCLES: usize = 144;

/// Simulated minutes per duty cycle.
const MINUTES_PER_CYCLE: f64 = 20.0;

const MINUTES_PER_DAY: f64 = 24.0 * 60.0;

/// Cycles during which the humidity sensor drops off the bus.
const ENS210_OUTAGE: std::ops::Range<usize> = 40..46;

// ---------------------------------------------------------------------------
// Physical world
// ---------------------------------------------------------------------------

/// Environment shared by every simulated peripheral.
struct World {
    minutes: f64,
    solar_voltage: f64,
    battery_voltage: f64,
    temperature_c: f64,
    humidity: f64,
    ens210_online: bool,
}

impl World {
    fn new() -> Self {
        let mut world = Self {
            minutes: 0.0,
            solar_voltage: 0.0,
            battery_voltage: 3.3,
            temperature_c: 0.0,
            humidity: 0.0,
            ens210_online: true,
        };
        world.advance(0.0);
        world
    }

    fn hour(&self) -> f64 {
        (self.minutes % MINUTES_PER_DAY) / 60.0
    }

    /// Move the clock forward and recompute the environment.
    fn advance(&mut self, minutes: f64) {
        self.minutes += minutes;
        let hour = self.hour();

        // Daylight from 06:00 to 18:00, peaking at noon
        self.solar_voltage = if (6.0..18.0).contains(&hour) {
            0.9 * (PI * (hour - 6.0) / 12.0).sin()
        } else {
            0.0
        };

        // Charge in sunlight, slow drain otherwise
        let charge = if self.solar_voltage > 0.3 { 0.01 } else { -0.004 };
        self.battery_voltage = (self.battery_voltage + charge * minutes / 20.0).clamp(2.9, 4.2);

        self.temperature_c = 12.0 + 8.0 * (2.0 * PI * (hour - 9.0) / 24.0).sin();
        self.humidity = 0.6 - 0.2 * (2.0 * PI * (hour - 9.0) / 24.0).sin();
    }

    fn power_good(&self) -> bool {
        self.solar_voltage > 0.6
    }
}

type SharedWorld = Rc<RefCell<World>>;

// ---------------------------------------------------------------------------
// Simulated peripherals
// ---------------------------------------------------------------------------

/// ADC sampling the world's panel and battery through the configured scaling.
struct SimAdc {
    world: SharedWorld,
    config: AdcConfig,
}

impl SimAdc {
    fn code(&self, volts: f64) -> u16 {
        let code = volts / f64::from(self.config.volts_per_code());
        code.round().clamp(0.0, f64::from(self.config.full_scale)) as u16
    }
}

impl AdcReader for SimAdc {
    type Error = Infallible;

    fn read_channel(&mut self, channel: u32) -> Result<u16, Self::Error> {
        let world = self.world.borrow();
        let volts = if channel == self.config.solar_channel {
            world.solar_voltage
        } else if channel == self.config.battery_channel {
            world.battery_voltage / f64::from(self.config.battery_divider)
        } else {
            0.0
        };
        Ok(self.code(volts))
    }
}

#[derive(Debug)]
struct AddressNack;

impl i2c::Error for AddressNack {
    fn kind(&self) -> i2c::ErrorKind {
        i2c::ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)
    }
}

/// I2C bus carrying the board temperature sensor and the humidity sensor.
struct SimBus {
    world: SharedWorld,
}

impl SimBus {
    fn at30ts01_register(&self) -> [u8; 2] {
        let raw = (self.world.borrow().temperature_c.max(0.0) * 16.0).round() as u16;
        (raw & 0x0FFF).to_be_bytes()
    }

    fn ens210_register(&self) -> [u8; 6] {
        let world = self.world.borrow();
        let t = ((world.temperature_c + 273.15) * 64.0).round() as u16;
        let h = (world.humidity * 51_200.0).round() as u16;
        let [t0, t1] = t.to_le_bytes();
        let [h0, h1] = h.to_le_bytes();
        // Third byte of each word carries the valid flag and CRC
        [t0, t1, 0x01, h0, h1, 0x01]
    }
}

impl i2c::ErrorType for SimBus {
    type Error = AddressNack;
}

impl I2c for SimBus {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let data: Vec<u8> = match address {
            AT30TS01_ADDRESS => self.at30ts01_register().to_vec(),
            ENS210_ADDRESS if self.world.borrow().ens210_online => {
                self.ens210_register().to_vec()
            }
            _ => return Err(AddressNack),
        };

        for op in operations.iter_mut() {
            if let Operation::Read(buf) = op {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = data.get(i).copied().unwrap_or(0);
                }
            }
        }
        Ok(())
    }
}

/// Battery measurement path enable.
struct BatteryPath;

impl digital::ErrorType for BatteryPath {
    type Error = Infallible;
}

impl OutputPin for BatteryPath {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// External supply power-good input.
struct PowerGood(SharedWorld);

impl digital::ErrorType for PowerGood {
    type Error = Infallible;
}

impl InputPin for PowerGood {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.0.borrow().power_good())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.0.borrow().power_good())
    }
}

/// Settle delays cost nothing in simulated time.
struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// LED outputs that log what would be sent down the wire.
#[derive(Default)]
struct SimLeds {
    powered: bool,
}

impl LedDriver for SimLeds {
    type Error = Infallible;

    fn set_load_power(&mut self, on: bool) -> Result<(), Self::Error> {
        if on != self.powered {
            debug!("LED load rail {}", if on { "up" } else { "down" });
        }
        self.powered = on;
        Ok(())
    }

    fn transmit(&mut self, strip: usize, data: &[u8]) -> Result<(), Self::Error> {
        debug!("Strip {}: {} bytes", strip, data.len());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Downlink schedule
// ---------------------------------------------------------------------------

fn color(red: u8, green: u8, blue: u8) -> Rgb {
    Rgb::new(expand_channel(red), expand_channel(green), expand_channel(blue))
}

/// Downlink delivered at the start of `cycle`, if any.
fn scheduled_downlink(cycle: usize, radio: &RadioConfig) -> Option<(u8, Vec<u8>)> {
    let control = |frame: ControlFrame| match frame.encode() {
        Ok(payload) => Some((radio.app_port, payload.to_vec())),
        Err(e) => {
            error!("Failed to build downlink: {}", e);
            None
        }
    };

    match cycle {
        // Manual mode, warm white on every strip
        0 => control(ControlFrame {
            enabled: true,
            auto_mode: false,
            strips: [color(63, 40, 12); 3],
        }),
        // Auto mode with one color per strip
        6 => control(ControlFrame {
            enabled: true,
            auto_mode: true,
            strips: [color(63, 0, 0), color(0, 63, 0), color(0, 0, 63)],
        }),
        30 => Some((radio.class_port, vec![2])),
        // Truncated control frame, must be rejected
        50 => Some((radio.app_port, vec![0xFF; 4])),
        // Unknown port
        60 => Some((42, vec![0x00])),
        120 => control(ControlFrame::default()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn report_uplink(cycle: usize, hour: f64, payload: &[u8]) {
    match TelemetryFrame::decode(payload) {
        Ok(frame) => info!(
            "#{:03} {:05.2}h uplink [{}] battery {:.1} V, solar {:.2} V, {:.2} °C, {:.0} % RH, power good {}",
            cycle,
            hour,
            hex(payload),
            frame.battery_voltage(),
            frame.solar_voltage(),
            frame.temperature_c(),
            frame.humidity() * 100.0,
            frame.power_good
        ),
        Err(e) => error!("#{:03} uplink [{}] does not decode: {}", cycle, hex(payload), e),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cycles = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_CYCLES);

    let config = SystemConfig::default();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return;
    }

    info!("Starting solarpath simulator");
    info!(
        "{} cycles, {} simulated minutes each (uplink period on hardware: {} ms)",
        cycles, MINUTES_PER_CYCLE, config.radio.uplink_period_ms
    );

    let world: SharedWorld = Rc::new(RefCell::new(World::new()));

    let hub = SensorHub::new(
        SimAdc {
            world: Rc::clone(&world),
            config: config.adc.clone(),
        },
        SimBus {
            world: Rc::clone(&world),
        },
        BatteryPath,
        NoDelay,
        config.adc.clone(),
    );
    let mut system = System::new(
        hub,
        SimLeds::default(),
        PowerGood(Rc::clone(&world)),
        &config,
    );

    for cycle in 0..cycles {
        world.borrow_mut().ens210_online = !ENS210_OUTAGE.contains(&cycle);

        if let Some((port, payload)) = scheduled_downlink(cycle, system.radio()) {
            let outcome = system.on_downlink(port, &payload);
            info!(
                "#{:03} downlink port {} [{}] -> {:?}",
                cycle,
                port,
                hex(&payload),
                outcome
            );
        }

        match system.on_uplink_tick() {
            Ok(payload) => report_uplink(cycle, world.borrow().hour(), &payload),
            Err(e) => error!("#{:03} uplink encode failed: {}", cycle, e),
        }

        world.borrow_mut().advance(MINUTES_PER_CYCLE);
    }

    info!(
        "Simulator exiting, LED load {:?}",
        system.actuator().load_state()
    );
}
