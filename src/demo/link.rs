//! Simulated vehicle link.
//!
//! Every replica holds its own copy of the link (it is inherited across
//! `fork`), so all readings are derived from the time elapsed since the
//! shared start instant rather than from mutable state.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Most recent attitude and position reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryData {
    /// Milliseconds since the vehicle booted.
    pub time_since_boot: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub x_velocity: f64,
    pub y_velocity: f64,
    pub z_velocity: f64,
    /// Radians.
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    /// Radians per second.
    pub roll_speed: f64,
    pub pitch_speed: f64,
    pub yaw_speed: f64,
}

/// Ground speeds of the simulated flight.
const VX: f64 = 0.8;
const VY: f64 = 1.2;
const VZ: f64 = 0.6;
const YAW_RATE: f64 = 0.15;
const START_ALTITUDE: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
pub struct SimulatedLink {
    boot: Instant,
    heartbeat_loss_after: Option<Duration>,
}

impl SimulatedLink {
    pub fn new(heartbeat_loss_after: Option<Duration>) -> Self {
        Self {
            boot: Instant::now(),
            heartbeat_loss_after,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.boot.elapsed()
    }

    /// Whether the vehicle emits a heartbeat at `at`.
    pub fn heartbeat_at(&self, at: Duration) -> bool {
        self.heartbeat_loss_after.is_none_or(|loss| at < loss)
    }

    /// Reading of the straight climbing flight at `at`.
    pub fn telemetry_at(&self, at: Duration) -> TelemetryData {
        let t = at.as_secs_f64();
        TelemetryData {
            time_since_boot: at.as_millis() as u64,
            x: VX * t,
            y: VY * t,
            z: START_ALTITUDE + VZ * t,
            x_velocity: VX,
            y_velocity: VY,
            z_velocity: VZ,
            roll: 0.0,
            pitch: 0.0,
            yaw: wrap_radians(YAW_RATE * t),
            roll_speed: 0.0,
            pitch_speed: 0.0,
            yaw_speed: YAW_RATE,
        }
    }
}

/// Wrap an angle into (-pi, pi].
pub fn wrap_radians(angle: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    let wrapped = angle.rem_euclid(TAU);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}
