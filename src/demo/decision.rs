//! Link liveness and flight decisions.

use super::link::TelemetryData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness of the vehicle link as seen by the heartbeat receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatState {
    Connected,
    Disconnected,
}

impl fmt::Display for HeartbeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Miss-count disconnect detection.
///
/// The link is connected as soon as one heartbeat arrives and disconnected
/// after `threshold` consecutive periods without one.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    threshold: u32,
    missed: u32,
    state: HeartbeatState,
}

impl HeartbeatMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            missed: 0,
            state: HeartbeatState::Disconnected,
        }
    }

    /// Record one period's outcome and return the resulting state.
    pub fn observe(&mut self, received: bool) -> HeartbeatState {
        if received {
            self.missed = 0;
            self.state = HeartbeatState::Connected;
        } else {
            self.missed = self.missed.saturating_add(1);
            if self.missed >= self.threshold {
                self.state = HeartbeatState::Disconnected;
            }
        }
        self.state
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

/// 3D position in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<[f64; 3]> for Position {
    fn from([x, y, z]: [f64; 3]) -> Self {
        Self { x, y, z }
    }
}

/// A command issued to the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// Relative altitude change in metres.
    ChangeAltitude(f64),
    /// Relative yaw change in degrees within [-180, 180]; positive is
    /// counter-clockwise.
    ChangeYaw(f64),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChangeAltitude(delta) => write!(f, "CHANGE_ALTITUDE: {:.2}", delta),
            Self::ChangeYaw(degrees) => write!(f, "CHANGING_YAW: {:.2}", degrees),
        }
    }
}

/// Decision-loop settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeciderConfig {
    pub target: Position,
    pub z_speed: f64,
    pub angle_tolerance_deg: f64,
    pub height_tolerance: f64,
}

/// Turns telemetry into altitude and yaw decisions.
#[derive(Debug, Clone)]
pub struct Decider {
    config: DeciderConfig,
    velocity_sum: [f64; 3],
    samples: u64,
}

impl Decider {
    pub fn new(config: DeciderConfig) -> Self {
        Self {
            config,
            velocity_sum: [0.0; 3],
            samples: 0,
        }
    }

    /// Average velocity over every sample seen so far.
    pub fn average_velocity(&self) -> Option<[f64; 3]> {
        if self.samples == 0 {
            return None;
        }
        let n = self.samples as f64;
        Some(self.velocity_sum.map(|v| v / n))
    }

    /// Altitude first, then heading; `None` when both are within tolerance.
    ///
    /// The altitude step is limited to what `z_speed` covers in `period_s`.
    pub fn decide(&mut self, data: &TelemetryData, period_s: f64) -> Option<Decision> {
        self.velocity_sum[0] += data.x_velocity;
        self.velocity_sum[1] += data.y_velocity;
        self.velocity_sum[2] += data.z_velocity;
        self.samples += 1;

        let target = self.config.target;
        let height_error = target.z - data.z;
        if height_error.abs() > self.config.height_tolerance {
            let max_step = (self.config.z_speed * period_s).abs();
            let step = if max_step > 0.0 {
                height_error.clamp(-max_step, max_step)
            } else {
                height_error
            };
            return Some(Decision::ChangeAltitude(step));
        }

        let bearing = (target.y - data.y).atan2(target.x - data.x).to_degrees();
        let relative = wrap_degrees(bearing - data.yaw.to_degrees());
        if relative.abs() > self.config.angle_tolerance_deg {
            return Some(Decision::ChangeYaw(relative));
        }
        None
    }
}

/// Wrap an angle into [-180, 180].
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && angle > 0.0 {
        180.0
    } else {
        wrapped
    }
}
