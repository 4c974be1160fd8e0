// ==========================================
// 配送调度核心 - 地理坐标值对象
// ==========================================
// 距离口径: 大圆距离 (haversine),单位 km
// ==========================================

use serde::{Deserialize, Serialize};

/// 地球平均半径（km）
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// 经纬度坐标（WGS84,度）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// 坐标是否合法（有限值且在经纬度范围内）
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// 大圆距离（km）
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }

    /// 球面中点
    pub fn midpoint(&self, other: &GeoPoint) -> GeoPoint {
        let lat1 = self.lat.to_radians();
        let lon1 = self.lon.to_radians();
        let lat2 = other.lat.to_radians();
        let d_lon = (other.lon - self.lon).to_radians();

        let bx = lat2.cos() * d_lon.cos();
        let by = lat2.cos() * d_lon.sin();
        let lat = (lat1.sin() + lat2.sin()).atan2(((lat1.cos() + bx).powi(2) + by.powi(2)).sqrt());
        let lon = lon1 + by.atan2(lat1.cos() + bx);

        GeoPoint::new(lat.to_degrees(), normalize_lon(lon.to_degrees()))
    }

    /// 沿 self -> other 方向线性外推
    ///
    /// factor = 1.0 返回 other,factor = 2.0 返回再走一倍位移后的点。
    /// 只用于短距离轨迹外推,不做大圆修正。
    pub fn extrapolate(&self, other: &GeoPoint, factor: f64) -> GeoPoint {
        let lat = self.lat + (other.lat - self.lat) * factor;
        let lon = self.lon + (other.lon - self.lon) * factor;
        GeoPoint::new(lat.clamp(-90.0, 90.0), normalize_lon(lon))
    }
}

/// 点集质心（算术平均,适用于城市级范围）
pub fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let lat = points.iter().map(|p| p.lat).sum::<f64>() / n;
    let lon = points.iter().map(|p| p.lon).sum::<f64>() / n;
    Some(GeoPoint::new(lat, lon))
}

fn normalize_lon(lon: f64) -> f64 {
    let mut v = lon;
    while v > 180.0 {
        v -= 360.0;
    }
    while v < -180.0 {
        v += 360.0;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_known_value() {
        // 上海人民广场 -> 陆家嘴 约 4km
        let a = GeoPoint::new(31.2304, 121.4737);
        let b = GeoPoint::new(31.2397, 121.4998);
        let d = a.distance_km(&b);
        assert!(d > 2.0 && d < 3.5, "distance={}", d);
        assert!(a.distance_km(&a) < 1e-9);
    }

    #[test]
    fn test_midpoint_is_equidistant() {
        let a = GeoPoint::new(31.20, 121.40);
        let b = GeoPoint::new(31.30, 121.60);
        let m = a.midpoint(&b);
        let da = a.distance_km(&m);
        let db = b.distance_km(&m);
        assert!((da - db).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_coordinates() {
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(GeoPoint::new(-33.9, 151.2).is_valid());
    }

    #[test]
    fn test_extrapolate() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.01, 0.02);
        let c = a.extrapolate(&b, 2.0);
        assert!((c.lat - 0.02).abs() < 1e-12);
        assert!((c.lon - 0.04).abs() < 1e-12);
    }
}
