//! Longitude/latitude validation with axis-swap repair.

const LON_RANGE: std::ops::RangeInclusive<f64> = -180.0..=180.0;
const LAT_RANGE: std::ops::RangeInclusive<f64> = -90.0..=90.0;

/// A value that may hold a coordinate in degrees, either numeric or textual.
pub trait Degrees {
    /// The value in degrees, `None` when missing or not a finite number.
    fn degrees(&self) -> Option<f64>;
}

impl Degrees for f64 {
    fn degrees(&self) -> Option<f64> {
        self.is_finite().then_some(*self)
    }
}

impl Degrees for f32 {
    fn degrees(&self) -> Option<f64> {
        f64::from(*self).degrees()
    }
}

impl Degrees for i32 {
    fn degrees(&self) -> Option<f64> {
        Some(f64::from(*self))
    }
}

impl Degrees for i64 {
    fn degrees(&self) -> Option<f64> {
        (*self as f64).degrees()
    }
}

impl Degrees for str {
    fn degrees(&self) -> Option<f64> {
        self.trim().parse::<f64>().ok()?.degrees()
    }
}

impl Degrees for String {
    fn degrees(&self) -> Option<f64> {
        self.as_str().degrees()
    }
}

impl<T: Degrees + ?Sized> Degrees for &T {
    fn degrees(&self) -> Option<f64> {
        (**self).degrees()
    }
}

impl<T: Degrees> Degrees for Option<T> {
    fn degrees(&self) -> Option<f64> {
        self.as_ref()?.degrees()
    }
}

/// A valid point. `swapped` is set when the input had its axes swapped and was repaired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
    pub swapped: bool,
}

fn in_range(lon: f64, lat: f64) -> bool {
    LON_RANGE.contains(&lon) && LAT_RANGE.contains(&lat)
}

/// Validates a longitude/latitude pair.
///
/// The pair is returned unchanged when it is in range, swapped when only the swapped
/// orientation is in range, and rejected otherwise or when either value is not a number.
///
/// ```
/// use reshard::sanitize;
///
/// let point = sanitize(37.5, 127.0).unwrap();
/// assert_eq!((point.lon, point.lat, point.swapped), (127.0, 37.5, true));
///
/// assert!(sanitize(500.0, 40.0).is_none());
/// ```
pub fn sanitize(lon: impl Degrees, lat: impl Degrees) -> Option<LonLat> {
    let (lon, lat) = (lon.degrees()?, lat.degrees()?);

    if in_range(lon, lat) {
        return Some(LonLat {
            lon,
            lat,
            swapped: false,
        });
    }

    if in_range(lat, lon) {
        return Some(LonLat {
            lon: lat,
            lat: lon,
            swapped: true,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_pair_is_kept() {
        assert_eq!(
            sanitize(126.978, 37.5665),
            Some(LonLat {
                lon: 126.978,
                lat: 37.5665,
                swapped: false
            })
        );
        assert_eq!(sanitize(-180.0, 90.0).map(|p| p.swapped), Some(false));
        assert_eq!(sanitize(0, 0).map(|p| (p.lon, p.lat)), Some((0.0, 0.0)));
    }

    #[test]
    fn swapped_pair_is_repaired() {
        assert_eq!(
            sanitize(37.5, 127.0),
            Some(LonLat {
                lon: 127.0,
                lat: 37.5,
                swapped: true
            })
        );
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert_eq!(sanitize(500.0, 40.0), None);
        assert_eq!(sanitize(200.0, 40.0), None);
        assert_eq!(sanitize(40.0, 200.0), None);
        assert_eq!(sanitize(-181.0, -91.0), None);
    }

    #[test]
    fn numeric_strings() {
        assert_eq!(
            sanitize("127.0", " 37.5 ").map(|p| (p.lon, p.lat)),
            Some((127.0, 37.5))
        );
        assert_eq!(
            sanitize("37.5".to_owned(), "127.0".to_owned()).map(|p| p.swapped),
            Some(true)
        );
        assert_eq!(sanitize("east", "37.5"), None);
        assert_eq!(sanitize("", "37.5"), None);
    }

    #[test]
    fn missing_or_non_finite() {
        assert_eq!(sanitize(None::<f64>, Some(37.5)), None);
        assert_eq!(sanitize(Some(127.0), Some(37.5)).map(|p| p.swapped), Some(false));
        assert_eq!(sanitize(f64::NAN, 37.5), None);
        assert_eq!(sanitize("inf", "37.5"), None);
    }
}
