use serde::{Deserialize, Serialize};

use serde_json::{Value, json};

// Mean Earth radius in meters.
const EARTH_RADIUS: f64 = 6_371_008.8;

/// The geographic location of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Altitude in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)?;
        if let Some(altitude) = self.altitude {
            write!(f, " at {altitude} m")?;
        }
        Ok(())
    }
}

impl Location {
    /// Creates a [`Location`].
    #[must_use]
    #[inline]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
        }
    }

    /// Sets the altitude.
    #[must_use]
    #[inline]
    pub const fn altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    /// Returns the great-circle distance in meters to another location.
    ///
    /// Altitudes are ignored.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        let latitude_a = self.latitude.to_radians();
        let latitude_b = other.latitude.to_radians();
        let delta_latitude = (other.latitude - self.latitude).to_radians();
        let delta_longitude = (other.longitude - self.longitude).to_radians();

        let a = (delta_latitude / 2.).sin().powi(2)
            + latitude_a.cos() * latitude_b.cos() * (delta_longitude / 2.).sin().powi(2);

        2. * EARTH_RADIUS * a.sqrt().atan2((1. - a).sqrt())
    }

    /// Checks whether the location lies within `radius` meters of `center`.
    #[must_use]
    #[inline]
    pub fn within(&self, center: &Self, radius: f64) -> bool {
        self.distance_to(center) <= radius
    }

    /// Encodes the location as a `GeoJSON` point.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let coordinates = match self.altitude {
            Some(altitude) => json!([self.longitude, self.latitude, altitude]),
            None => json!([self.longitude, self.latitude]),
        };
        json!({ "type": "Point", "coordinates": coordinates })
    }

    /// Decodes a location from either a `GeoJSON` point or an object with
    /// `latitude`, `longitude` and optional `altitude` fields.
    ///
    /// The return value is [`None`] when the value is neither of them.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("type").and_then(Value::as_str) == Some("Point") {
            let coordinates = value.get("coordinates")?.as_array()?;
            let longitude = coordinates.first()?.as_f64()?;
            let latitude = coordinates.get(1)?.as_f64()?;
            let location = Self::new(latitude, longitude);
            return Some(match coordinates.get(2).and_then(Value::as_f64) {
                Some(altitude) => location.altitude(altitude),
                None => location,
            });
        }

        serde_json::from_value(value.clone()).ok()
    }
}
