use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical meter reading. Field names are the persisted record columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MeterReading {
    /// Volts, phase 1.
    pub voltage: f64,
    /// Amperes, phase 1.
    pub current: f64,
    /// Active power in watts.
    pub power: f64,
    /// Hz.
    pub frequency: f64,
    /// kVA.
    pub apparent: f64,
    /// kVAR.
    pub reactive: f64,
    /// Cumulative active energy, kWh.
    pub energy: f64,
    pub power_factor: f64,
    /// Phase angle in degrees.
    pub phase1: f64,
    /// Cumulative apparent energy, kVAh.
    pub energy_apparent: f64,
    /// Cumulative reactive energy, kVARh.
    pub energy_reactive: f64,
}

impl MeterReading {
    pub const ZERO: MeterReading = MeterReading {
        voltage: 0.0,
        current: 0.0,
        power: 0.0,
        frequency: 0.0,
        apparent: 0.0,
        reactive: 0.0,
        energy: 0.0,
        power_factor: 0.0,
        phase1: 0.0,
        energy_apparent: 0.0,
        energy_reactive: 0.0,
    };

    /// Voltage, current and active power all read exactly zero.
    pub fn is_zero_activity(&self) -> bool {
        self.voltage == 0.0 && self.current == 0.0 && self.power == 0.0
    }
}

/// Maps a raw meter payload onto a [`MeterReading`].
///
/// Returns `None` when there is no payload at all or it is not a field map;
/// individual missing or non-numeric fields read as zero. The meter reports
/// summed active power in kW, which is stored in W.
pub fn normalize(raw: Option<&Value>) -> Option<MeterReading> {
    let fields = raw?.as_object()?;
    let field = |key: &str| fields.get(key).map(coerce).unwrap_or(0.0);

    Some(MeterReading {
        voltage: field("V1"),
        current: field("A1"),
        power: field("P_SUM") * 1000.0,
        frequency: field("FREQ"),
        apparent: field("S_SUM"),
        reactive: field("Q_SUM"),
        energy: field("WH"),
        power_factor: field("PF_SUM"),
        phase1: field("PHASE1"),
        energy_apparent: field("SH"),
        energy_reactive: field("QH"),
    })
}

fn coerce(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}
