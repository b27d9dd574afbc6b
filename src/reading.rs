use crate::{error::Error, power::dbm_to_power, source::RadioSource};
use nalgebra::{DMatrix, Point, SMatrix};
use uom::si::f64::Power;

/// A single observation of a [`RadioSource`] made at a known position.
///
/// A reading carries a measured distance, a received power, or both. Each
/// channel may carry its own standard deviation, and the position of the
/// observer may carry a covariance describing how well it was located.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading<const D: usize> {
    source: RadioSource,
    position: Point<f64, D>,

    /// Measured distance to the source in metres.
    distance: Option<f64>,
    distance_std: Option<f64>,

    /// Received power in dBm.
    rssi: Option<f64>,
    rssi_std: Option<f64>,

    position_covariance: Option<SMatrix<f64, D, D>>,
}

impl<const D: usize> Reading<D> {
    /// Creates a ranging reading.
    ///
    /// Returns an error if `distance` is negative or not finite.
    pub fn ranging(
        source: RadioSource,
        position: Point<f64, D>,
        distance: f64,
    ) -> Result<Self, Error> {
        Self::bare(source, position)?.with_distance(distance)
    }

    /// Creates a received signal strength reading from `rssi` in dBm.
    pub fn rssi(source: RadioSource, position: Point<f64, D>, rssi: f64) -> Result<Self, Error> {
        Self::bare(source, position)?.with_rssi(rssi)
    }

    /// Creates a reading carrying both a distance and a received power.
    pub fn ranging_and_rssi(
        source: RadioSource,
        position: Point<f64, D>,
        distance: f64,
        rssi: f64,
    ) -> Result<Self, Error> {
        Self::bare(source, position)?
            .with_distance(distance)?
            .with_rssi(rssi)
    }

    fn bare(source: RadioSource, position: Point<f64, D>) -> Result<Self, Error> {
        if let Some(value) = position.coords.iter().find(|v| !v.is_finite()) {
            return Err(Error::NonFinite { value: *value });
        }

        Ok(Self {
            source,
            position,
            distance: None,
            distance_std: None,
            rssi: None,
            rssi_std: None,
            position_covariance: None,
        })
    }

    fn with_distance(mut self, distance: f64) -> Result<Self, Error> {
        if !distance.is_finite() {
            return Err(Error::NonFinite { value: distance });
        }
        if distance < 0.0 {
            return Err(Error::NegativeDistance { distance });
        }

        self.distance = Some(distance);
        Ok(self)
    }

    fn with_rssi(mut self, rssi: f64) -> Result<Self, Error> {
        if !rssi.is_finite() {
            return Err(Error::NonFinite { value: rssi });
        }

        self.rssi = Some(rssi);
        Ok(self)
    }

    /// Attaches a standard deviation in metres to the distance.
    ///
    /// Fails with [`Error::MissingChannel`] on readings without a distance.
    pub fn with_distance_std(mut self, std: f64) -> Result<Self, Error> {
        if self.distance.is_none() {
            return Err(Error::MissingChannel);
        }

        self.distance_std = Some(checked_std(std)?);
        Ok(self)
    }

    /// Attaches a standard deviation in dB to the received power.
    pub fn with_rssi_std(mut self, std: f64) -> Result<Self, Error> {
        if self.rssi.is_none() {
            return Err(Error::MissingChannel);
        }

        self.rssi_std = Some(checked_std(std)?);
        Ok(self)
    }

    /// Attaches a covariance to the observer position.
    ///
    /// The covariance must be finite, symmetric and positive semi-definite.
    pub fn with_position_covariance(mut self, covariance: SMatrix<f64, D, D>) -> Result<Self, Error> {
        if !is_covariance(&covariance) {
            return Err(Error::InvalidPositionCovariance);
        }

        self.position_covariance = Some(covariance);
        Ok(self)
    }

    pub fn source(&self) -> &RadioSource {
        &self.source
    }

    pub fn position(&self) -> &Point<f64, D> {
        &self.position
    }

    pub fn distance(&self) -> Option<f64> {
        self.distance
    }

    pub fn distance_std(&self) -> Option<f64> {
        self.distance_std
    }

    /// Received power in dBm.
    pub fn rssi_dbm(&self) -> Option<f64> {
        self.rssi
    }

    pub fn rssi_std(&self) -> Option<f64> {
        self.rssi_std
    }

    pub fn received_power(&self) -> Option<Power> {
        self.rssi.map(dbm_to_power)
    }

    pub fn position_covariance(&self) -> Option<&SMatrix<f64, D, D>> {
        self.position_covariance.as_ref()
    }

    pub fn has_distance(&self) -> bool {
        self.distance.is_some()
    }

    pub fn has_rssi(&self) -> bool {
        self.rssi.is_some()
    }
}

fn checked_std(std: f64) -> Result<f64, Error> {
    match std.is_finite() && std > 0.0 {
        true => Ok(std),
        false => Err(Error::InvalidStandardDeviation { std }),
    }
}

fn is_covariance<const D: usize>(covariance: &SMatrix<f64, D, D>) -> bool {
    if covariance.iter().any(|v| !v.is_finite()) {
        return false;
    }

    let tolerance = 1e-9 * covariance.amax().max(1.0);
    if (covariance - covariance.transpose()).amax() > tolerance {
        return false;
    }

    DMatrix::from_column_slice(D, D, covariance.as_slice())
        .symmetric_eigenvalues()
        .iter()
        .all(|&eigenvalue| eigenvalue >= -tolerance)
}
