use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in decimal degrees (WGS84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub lat: f64,
    pub lon: f64,
}

impl Coords {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// The (0, 0) placeholder the map starts on before any real location.
    pub fn is_sentinel(&self) -> bool {
        self.lat == 0.0 && self.lon == 0.0
    }
}

/// A single device-reported location sample.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    pub lat: f64,
    pub lon: f64,
    /// Horizontal accuracy in meters. NaN when the device gave no estimate.
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

impl LocationFix {
    pub fn coords(&self) -> Coords {
        Coords::new(self.lat, self.lon)
    }

    pub fn epoch_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Locality fields returned by ip-api.com for an address.
///
/// Every field is optional: a `"fail"` status only carries `status`,
/// `message` and `query`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locality {
    pub status: Option<String>,
    pub message: Option<String>,
    pub country: Option<String>,
    pub region_name: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub query: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
}

impl Locality {
    pub fn coords(&self) -> Option<Coords> {
        Some(Coords::new(self.lat?, self.lon?))
    }
}

/// Body of `GET /api/ip`, as seen by the map view.
///
/// Only `{ ip, location }` answers carry a locality. The flat localhost
/// fallback and the `{ error }` body both decode with `location: None`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IpLookup {
    pub ip: Option<String>,
    pub location: Option<Locality>,
}

impl IpLookup {
    /// Where the map should start if no device fix has arrived yet.
    pub fn center(&self) -> Option<Coords> {
        self.location.as_ref().and_then(Locality::coords)
    }
}

/// Fixed payload answered when the request came from this machine and the
/// public address could not be discovered.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalhostFallback {
    pub ip: &'static str,
    pub lat: f64,
    pub lon: f64,
    pub city: &'static str,
    pub country: &'static str,
    pub region_name: &'static str,
    pub zip: &'static str,
    pub status: &'static str,
    pub isp: &'static str,
    pub org: &'static str,
    pub is_localhost: bool,
}

impl Default for LocalhostFallback {
    fn default() -> Self {
        Self {
            ip: "::1",
            lat: 40.7128,
            lon: -74.006,
            city: "New York",
            country: "United States",
            region_name: "New York",
            zip: "10001",
            status: "success",
            isp: "localhost",
            org: "localhost",
            is_localhost: true,
        }
    }
}

/// `{ ip, location }` where `location` is ip-api's payload, untouched.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyResponse {
    pub ip: String,
    pub location: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Deserialize)]
pub struct IpEchoResponse {
    pub ip: String,
}
