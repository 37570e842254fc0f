//! Serving region selection by great-circle distance

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::RegionsConfig;
use crate::models::{Coordinates, Region};
use crate::Result;

/// Earth radius in km
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in km
pub fn haversine_distance(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Resolves a network address to coordinates
#[cfg_attr(test, mockall::automock)]
pub trait GeoLocator: Send + Sync {
    /// `Ok(None)` when the address is unknown to the database
    fn locate(&self, addr: IpAddr) -> Result<Option<Coordinates>>;
}

/// What is known about where a request came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallerLocation {
    Address(IpAddr),
    Coordinates(Coordinates),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionChoice {
    pub code: String,
    /// Distance from the caller, absent when the default was used
    pub distance_km: Option<f64>,
    pub fallback: bool,
}

pub struct RegionSelector {
    catalog: Vec<Region>,
    default_region: String,
    locator: Option<Arc<dyn GeoLocator>>,
}

impl RegionSelector {
    pub fn new(catalog: Vec<Region>, default_region: impl Into<String>) -> Self {
        Self {
            catalog,
            default_region: default_region.into(),
            locator: None,
        }
    }

    /// Selector over the configured catalog, or the built-in one when empty
    pub fn from_config(config: &RegionsConfig) -> Self {
        let catalog = if config.catalog.is_empty() {
            builtin_catalog()
        } else {
            config.catalog.clone()
        };
        Self::new(catalog, config.default_region.clone())
    }

    pub fn with_locator(mut self, locator: Arc<dyn GeoLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn catalog(&self) -> &[Region] {
        &self.catalog
    }

    pub fn default_region(&self) -> &str {
        &self.default_region
    }

    /// Closest catalog region; ties go to the earlier catalog entry
    pub fn nearest(&self, caller: Coordinates) -> Option<(&Region, f64)> {
        let mut best: Option<(&Region, f64)> = None;
        for region in &self.catalog {
            let distance = haversine_distance(caller, region.location);
            if !distance.is_finite() {
                continue;
            }
            match best {
                Some((_, d)) if d <= distance => {}
                _ => best = Some((region, distance)),
            }
        }
        best
    }

    pub fn select(&self, caller: &CallerLocation) -> RegionChoice {
        let coordinates = match caller {
            CallerLocation::Coordinates(c) => Some(*c),
            CallerLocation::Address(addr) => self.resolve(*addr),
            CallerLocation::Unknown => None,
        };

        if let Some((region, distance)) = coordinates.and_then(|c| self.nearest(c)) {
            tracing::debug!(region = %region.code, distance_km = distance, "Selected nearest region");
            return RegionChoice {
                code: region.code.clone(),
                distance_km: Some(distance),
                fallback: false,
            };
        }

        tracing::debug!(region = %self.default_region, "Using default region");
        RegionChoice {
            code: self.default_region.clone(),
            distance_km: None,
            fallback: true,
        }
    }

    fn resolve(&self, addr: IpAddr) -> Option<Coordinates> {
        let locator = self.locator.as_ref()?;
        match locator.locate(addr) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Geolocation failed, falling back to default region");
                None
            }
        }
    }
}

/// Regions used when the configuration lists none
pub fn builtin_catalog() -> Vec<Region> {
    vec![
        Region::new("us-east-1", "N. Virginia", 38.13, -78.45),
        Region::new("us-east-2", "Ohio", 39.96, -83.0),
        Region::new("us-west-2", "Oregon", 45.84, -119.7),
        Region::new("ca-central-1", "Montreal", 45.5, -73.57),
        Region::new("sa-east-1", "Sao Paulo", -23.55, -46.63),
        Region::new("eu-west-1", "Ireland", 53.35, -6.26),
        Region::new("eu-west-2", "London", 51.51, -0.13),
        Region::new("eu-central-1", "Frankfurt", 50.11, 8.68),
        Region::new("ap-south-1", "Mumbai", 19.08, 72.88),
        Region::new("ap-southeast-1", "Singapore", 1.35, 103.82),
        Region::new("ap-northeast-1", "Tokyo", 35.68, 139.69),
        Region::new("ap-southeast-2", "Sydney", -33.87, 151.21),
        Region::new("af-south-1", "Cape Town", -33.92, 18.42),
    ]
}
