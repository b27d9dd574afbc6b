//! Power conversions and the log-distance path loss model.
//!
//! All distances are in metres and the path loss model uses a reference
//! distance of one metre:
//!
//! ```text
//! P_rx = P_tx - 10 n log10(d)
//! ```

use uom::si::{f64::Power, power::milliwatt};

/// Path loss exponent of free space propagation.
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Converts a power level in dBm into a [`Power`].
pub fn dbm_to_power(dbm: f64) -> Power {
    Power::new::<milliwatt>(10f64.powf(dbm / 10.))
}

/// Converts a [`Power`] into a power level in dBm.
///
/// Returns negative infinity for zero power.
pub fn power_to_dbm(power: Power) -> f64 {
    10. * power.get::<milliwatt>().log10()
}

/// Received power in dBm at `distance` from an emitter transmitting `tx_dbm`.
pub fn received_power_dbm(tx_dbm: f64, distance: f64, exponent: f64) -> f64 {
    tx_dbm - 10. * exponent * distance.log10()
}

/// Distance at which an emitter transmitting `tx_dbm` is received at `rx_dbm`.
pub fn distance_from_power(tx_dbm: f64, rx_dbm: f64, exponent: f64) -> f64 {
    10f64.powf((tx_dbm - rx_dbm) / (10. * exponent))
}
