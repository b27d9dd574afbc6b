use crate::power::dbm_to_power;
use nalgebra::{Point, SMatrix};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uom::si::f64::{Frequency, Power};

/// The kind of emitter a [`RadioSource`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SourceKind {
    WifiAccessPoint,
    Beacon,
}

/// Identity of a radio emitter.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RadioSource {
    kind: SourceKind,

    /// BSSID for access points, or the concatenated identifiers of a beacon.
    id: String,

    /// Carrier frequency of the emitter.
    frequency: Frequency,
}

impl RadioSource {
    pub fn new(kind: SourceKind, id: impl Into<String>, frequency: Frequency) -> Self {
        Self {
            kind,
            id: id.into(),
            frequency,
        }
    }

    /// Creates a WiFi access point identified by its `bssid`.
    pub fn wifi_access_point(bssid: impl Into<String>, frequency: Frequency) -> Self {
        Self::new(SourceKind::WifiAccessPoint, bssid, frequency)
    }

    /// Creates a Bluetooth beacon identified by `id`.
    pub fn beacon(id: impl Into<String>, frequency: Frequency) -> Self {
        Self::new(SourceKind::Beacon, id, frequency)
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }
}

/// A [`RadioSource`] together with its estimated location and, when the
/// power channel was used, its transmitted power and path loss exponent.
#[derive(Clone, Debug, PartialEq)]
pub struct LocatedSource<const D: usize> {
    source: RadioSource,
    position: Point<f64, D>,
    transmitted_power_dbm: Option<f64>,
    path_loss_exponent: Option<f64>,
    position_covariance: Option<SMatrix<f64, D, D>>,
}

impl<const D: usize> LocatedSource<D> {
    pub fn new(
        source: RadioSource,
        position: Point<f64, D>,
        transmitted_power_dbm: Option<f64>,
        path_loss_exponent: Option<f64>,
        position_covariance: Option<SMatrix<f64, D, D>>,
    ) -> Self {
        Self {
            source,
            position,
            transmitted_power_dbm,
            path_loss_exponent,
            position_covariance,
        }
    }

    pub fn source(&self) -> &RadioSource {
        &self.source
    }

    pub fn position(&self) -> &Point<f64, D> {
        &self.position
    }

    pub fn transmitted_power_dbm(&self) -> Option<f64> {
        self.transmitted_power_dbm
    }

    pub fn transmitted_power(&self) -> Option<Power> {
        self.transmitted_power_dbm.map(dbm_to_power)
    }

    pub fn path_loss_exponent(&self) -> Option<f64> {
        self.path_loss_exponent
    }

    pub fn position_covariance(&self) -> Option<&SMatrix<f64, D, D>> {
        self.position_covariance.as_ref()
    }
}
