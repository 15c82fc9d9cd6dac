//! WKB geometry decoding for GeoParquet columns.
//!
//! ISO WKB and PostGIS EWKB are both accepted; the dialect is picked from the
//! header's type word. Z and M ordinates are dropped. Which geometry types
//! are acceptable is decided by the loader, not here.

use geo_types::Geometry;
use geozero::wkb::{Ewkb, Wkb};
use geozero::ToGeo;

/// EWKB Z, M and SRID flags in the geometry type word.
const EWKB_FLAGS: u32 = 0xE000_0000;

/// Decode one WKB or EWKB value into a geometry.
pub fn decode_wkb(bytes: &[u8]) -> Result<Geometry<f64>, String> {
    let geometry = if is_ewkb(bytes) {
        Ewkb(bytes.to_vec()).to_geo()
    } else {
        Wkb(bytes.to_vec()).to_geo()
    };
    geometry.map_err(|e| format!("WKB decode error: {}", e))
}

fn is_ewkb(bytes: &[u8]) -> bool {
    let (Some(&order), Some(raw)) = (bytes.first(), bytes.get(1..5)) else {
        return false;
    };
    let mut word = [0u8; 4];
    word.copy_from_slice(raw);
    let type_id = if order == 1 {
        u32::from_le_bytes(word)
    } else {
        u32::from_be_bytes(word)
    };
    type_id & EWKB_FLAGS != 0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use geo_types::Coord;

    const WKB_POINT: u32 = 1;
    const WKB_POLYGON: u32 = 3;
    const WKB_MULTIPOLYGON: u32 = 6;
    const EWKB_Z: u32 = 0x8000_0000;
    const EWKB_SRID: u32 = 0x2000_0000;

    /// Encode a polygon as little-endian ISO WKB (test fixture helper).
    pub(crate) fn polygon_wkb(rings: &[&[(f64, f64)]]) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
        out.extend_from_slice(&(rings.len() as u32).to_le_bytes());
        for ring in rings {
            out.extend_from_slice(&(ring.len() as u32).to_le_bytes());
            for (x, y) in ring.iter() {
                out.extend_from_slice(&x.to_le_bytes());
                out.extend_from_slice(&y.to_le_bytes());
            }
        }
        out
    }

    const SQUARE: &[(f64, f64)] = &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0), (0.0, 0.0)];

    #[test]
    fn test_decode_polygon_le() {
        match decode_wkb(&polygon_wkb(&[SQUARE])).unwrap() {
            Geometry::Polygon(p) => {
                assert_eq!(p.exterior().0.len(), 5);
                assert!(p.interiors().is_empty());
                assert_eq!(p.exterior().0[2], Coord { x: 1.0, y: 1.0 });
            }
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_polygon_be_with_hole() {
        let hole: &[(f64, f64)] = &[(0.2, 0.2), (0.4, 0.2), (0.4, 0.4), (0.2, 0.2)];
        let mut out = vec![0u8];
        out.extend_from_slice(&WKB_POLYGON.to_be_bytes());
        out.extend_from_slice(&2u32.to_be_bytes());
        for ring in [SQUARE, hole] {
            out.extend_from_slice(&(ring.len() as u32).to_be_bytes());
            for (x, y) in ring {
                out.extend_from_slice(&x.to_be_bytes());
                out.extend_from_slice(&y.to_be_bytes());
            }
        }
        match decode_wkb(&out).unwrap() {
            Geometry::Polygon(p) => assert_eq!(p.interiors().len(), 1),
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_multipolygon() {
        let mut out = vec![1u8];
        out.extend_from_slice(&WKB_MULTIPOLYGON.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend(polygon_wkb(&[SQUARE]));
        out.extend(polygon_wkb(&[SQUARE]));
        match decode_wkb(&out).unwrap() {
            Geometry::MultiPolygon(mp) => assert_eq!(mp.0.len(), 2),
            other => panic!("expected multipolygon, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_ewkb_z_with_srid() {
        let mut out = vec![1u8];
        out.extend_from_slice(&(WKB_POLYGON | EWKB_Z | EWKB_SRID).to_le_bytes());
        out.extend_from_slice(&4326u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(SQUARE.len() as u32).to_le_bytes());
        for (x, y) in SQUARE {
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
            out.extend_from_slice(&5.0f64.to_le_bytes());
        }
        assert!(is_ewkb(&out));
        match decode_wkb(&out).unwrap() {
            Geometry::Polygon(p) => assert_eq!(p.exterior().0[1], Coord { x: 1.0, y: 0.0 }),
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_points_decode_and_truncation_fails() {
        let mut point = vec![1u8];
        point.extend_from_slice(&WKB_POINT.to_le_bytes());
        point.extend_from_slice(&2f64.to_le_bytes());
        point.extend_from_slice(&3f64.to_le_bytes());
        assert!(matches!(decode_wkb(&point).unwrap(), Geometry::Point(_)));

        let full = polygon_wkb(&[SQUARE]);
        assert!(decode_wkb(&full[..full.len() - 3]).is_err());
        assert!(decode_wkb(&[]).is_err());
    }
}
