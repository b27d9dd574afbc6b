use crate::{error::Error, reading::Reading};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Describes which channels of a [`Reading`] an estimator consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SourceModel {
    /// Every reading carries a distance. Only the position is estimated.
    Ranging,

    /// Every reading carries a received power.
    Rssi,

    /// Readings carry a distance, a received power, or both.
    RangingAndRssi,
}

/// Parameters estimated in addition to the position of the source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Targets {
    pub transmitted_power: bool,
    pub path_loss_exponent: bool,
}

impl Targets {
    pub fn position_only() -> Self {
        Self::default()
    }

    pub fn with_transmitted_power(mut self, enabled: bool) -> Self {
        self.transmitted_power = enabled;
        self
    }

    pub fn with_path_loss_exponent(mut self, enabled: bool) -> Self {
        self.path_loss_exponent = enabled;
        self
    }

    /// Number of estimated parameters besides the position.
    pub fn count(&self) -> usize {
        self.transmitted_power as usize + self.path_loss_exponent as usize
    }

    pub fn any(&self) -> bool {
        self.count() > 0
    }
}

impl SourceModel {
    pub fn uses_distance(&self) -> bool {
        matches!(self, Self::Ranging | Self::RangingAndRssi)
    }

    pub fn uses_rssi(&self) -> bool {
        matches!(self, Self::Rssi | Self::RangingAndRssi)
    }

    /// Targets estimated by default.
    ///
    /// Power based models estimate the transmitted power and keep the path
    /// loss exponent fixed.
    pub fn default_targets(&self) -> Targets {
        Targets::position_only().with_transmitted_power(self.uses_rssi())
    }

    /// Returns an error if `targets` cannot be estimated with this model.
    pub fn check_targets(&self, targets: Targets) -> Result<(), Error> {
        match !self.uses_rssi() && targets.any() {
            true => Err(Error::UnsupportedTarget),
            false => Ok(()),
        }
    }

    /// Distance of `reading` if this model consumes it.
    pub fn distance_of<const D: usize>(&self, reading: &Reading<D>) -> Option<f64> {
        reading.distance().filter(|_| self.uses_distance())
    }

    /// Received power of `reading` if this model consumes it.
    pub fn rssi_of<const D: usize>(&self, reading: &Reading<D>) -> Option<f64> {
        reading.rssi_dbm().filter(|_| self.uses_rssi())
    }

    /// Returns `true` if `reading` carries every channel this model requires.
    pub fn accepts<const D: usize>(&self, reading: &Reading<D>) -> bool {
        match self {
            Self::Ranging => reading.has_distance(),
            Self::Rssi => reading.has_rssi(),
            Self::RangingAndRssi => reading.has_distance() || reading.has_rssi(),
        }
    }

    /// Smallest number of readings that determines the position and `targets`.
    pub fn min_readings<const D: usize>(&self, targets: Targets) -> usize {
        D + 1 + targets.count()
    }

    /// Returns `true` if `readings` can be used to estimate `targets`.
    ///
    /// Pure ranging readings never satisfy the power requirement of a mixed
    /// model, while readings carrying both channels count for both.
    pub fn is_valid<'r, const D: usize, I>(&self, readings: I, targets: Targets) -> bool
    where
        I: IntoIterator<Item = &'r Reading<D>>,
    {
        let mut count = 0;
        let mut with_rssi = 0;
        for reading in readings {
            if !self.accepts(reading) {
                return false;
            }

            count += 1;
            with_rssi += reading.has_rssi() as usize;
        }

        count > 0
            && count >= self.min_readings::<D>(targets)
            && (!self.uses_rssi() || with_rssi >= targets.count())
    }
}
