//! Hardware capabilities the device runtime drives. The `gpio` feature gates
//! the real rppal output driver; without it, a mock implementation logs state
//! changes. The `sim` feature provides a simulated climate probe.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature: f64,
    pub humidity: f64,
}

/// Temperature/humidity probe.
pub trait ClimateSensor: Send {
    fn read(&mut self) -> Result<ClimateReading>;
}

/// Binary output (pump, relay).
pub trait Switch: Send {
    fn set(&mut self, on: bool) -> Result<()>;
}

/// Addressable LED strip split into a right and a left zone.
pub trait PixelStrip: Send {
    fn show(&mut self, right: Rgb, left: Rgb) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO switch (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioSwitch {
    pin: OutputPin,
}

#[cfg(feature = "gpio")]
impl GpioSwitch {
    pub fn new(pin_num: u8) -> Result<Self> {
        let mut pin = Gpio::new()?.get(pin_num)?.into_output();
        // Fail-safe: ensure "OFF" at startup
        pin.set_low();
        info!(pin = pin_num, "gpio output initialised");
        Ok(Self { pin })
    }
}

#[cfg(feature = "gpio")]
impl Switch for GpioSwitch {
    fn set(&mut self, on: bool) -> Result<()> {
        if on {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        debug!(pin = self.pin.pin(), on, "gpio output set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock GPIO switch (no hardware, logs state changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct GpioSwitch {
    pin: u8,
    pub(crate) on: bool,
}

#[cfg(not(feature = "gpio"))]
impl GpioSwitch {
    pub fn new(pin_num: u8) -> Result<Self> {
        info!(pin = pin_num, "[mock-gpio] output registered (not wired)");
        Ok(Self {
            pin: pin_num,
            on: false,
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl Switch for GpioSwitch {
    fn set(&mut self, on: bool) -> Result<()> {
        if self.on != on {
            info!(pin = self.pin, on, "[mock-gpio] output changed");
        }
        self.on = on;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LED strip frame buffer
// ---------------------------------------------------------------------------

/// Keeps the pixel frame in memory and logs each change. Stands in for the
/// ws281x driver, which is not linked into this binary.
pub struct LoggingStrip {
    pin: u8,
    pixels: Vec<Rgb>,
}

impl LoggingStrip {
    pub fn new(pixel_count: usize, pin: u8) -> Self {
        info!(pin, pixel_count, "led strip registered (frame buffer only)");
        Self {
            pin,
            pixels: vec![Rgb::OFF; pixel_count],
        }
    }

    /// Right zone is the first half of the strip, left zone the rest.
    fn split(&self) -> usize {
        self.pixels.len() / 2
    }
}

impl PixelStrip for LoggingStrip {
    fn show(&mut self, right: Rgb, left: Rgb) -> Result<()> {
        let split = self.split();
        let changed = self.pixels.first() != Some(&right) || self.pixels.last() != Some(&left);
        let (r, l) = self.pixels.split_at_mut(split);
        r.fill(right);
        l.fill(left);
        if changed {
            info!(pin = self.pin, ?right, ?left, "led frame changed");
        } else {
            debug!(pin = self.pin, "led frame unchanged");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Simulated climate probe (development)
// ---------------------------------------------------------------------------

/// Random-walk temperature/humidity source with mean reversion.
#[cfg(feature = "sim")]
pub struct SimulatedClimate {
    temperature: f64,
    humidity: f64,
}

#[cfg(feature = "sim")]
impl SimulatedClimate {
    const TEMP_CENTER: f64 = 24.0;
    const HUMIDITY_CENTER: f64 = 60.0;
    const REVERSION: f64 = 0.1;

    pub fn new() -> Self {
        Self {
            temperature: Self::TEMP_CENTER,
            humidity: Self::HUMIDITY_CENTER,
        }
    }

    fn step(value: f64, center: f64, sigma: f64) -> f64 {
        let walk = (fastrand::f64() - 0.5) * 2.0 * sigma;
        value + Self::REVERSION * (center - value) + walk
    }
}

#[cfg(feature = "sim")]
impl Default for SimulatedClimate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "sim")]
impl ClimateSensor for SimulatedClimate {
    fn read(&mut self) -> Result<ClimateReading> {
        self.temperature = Self::step(self.temperature, Self::TEMP_CENTER, 0.3).clamp(-40.0, 80.0);
        self.humidity = Self::step(self.humidity, Self::HUMIDITY_CENTER, 1.0).clamp(0.0, 100.0);
        Ok(ClimateReading {
            temperature: (self.temperature * 10.0).round() / 10.0,
            humidity: (self.humidity * 10.0).round() / 10.0,
        })
    }
}

/// Open the climate probe wired to `pin`.
pub fn open_climate_sensor(pin: u8) -> Result<Box<dyn ClimateSensor>> {
    #[cfg(feature = "sim")]
    {
        info!(pin, "climate probe simulated");
        Ok(Box::new(SimulatedClimate::new()))
    }
    #[cfg(not(feature = "sim"))]
    {
        anyhow::bail!("climate probe on gpio {pin}: no driver built in (enable the `sim` feature)")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
