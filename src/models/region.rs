//! Serving region model

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// A region workspaces can be served from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Control-plane region code, e.g. `eu-west-1`
    pub code: String,
    pub name: String,
    pub location: Coordinates,
}

impl Region {
    pub fn new(code: impl Into<String>, name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            location: Coordinates::new(latitude, longitude),
        }
    }
}
