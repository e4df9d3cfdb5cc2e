//! Decode for `LOCAL_MAP_UPDATE` frame payloads. Mirrors
//! `src/pypipboy/dataparser.py::LocalMapUpdateParser`.

use crate::error::Result;
use crate::wire;
use std::io::Cursor;

/// A single 2D corner point in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub x: f32,
    pub y: f32,
}

/// A decoded local-map tile update. `pixels` is the untouched remainder of the
/// payload; this crate does not interpret the raster.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMapUpdate {
    pub width: u32,
    pub height: u32,
    pub north_west: Corner,
    pub north_east: Corner,
    pub south_west: Corner,
    pub pixels: Vec<u8>,
}

pub fn decode_localmap(data: &[u8]) -> Result<LocalMapUpdate> {
    let mut cursor = Cursor::new(data);

    let width = wire::read_u32(&mut cursor)?;
    let height = wire::read_u32(&mut cursor)?;
    let north_west = read_corner(&mut cursor)?;
    let north_east = read_corner(&mut cursor)?;
    let south_west = read_corner(&mut cursor)?;

    let tail_start = cursor.position() as usize;
    let pixels = data[tail_start..].to_vec();

    Ok(LocalMapUpdate {
        width,
        height,
        north_west,
        north_east,
        south_west,
        pixels,
    })
}

fn read_corner(cursor: &mut Cursor<&[u8]>) -> Result<Corner> {
    let x = wire::read_f32(cursor)?;
    let y = wire::read_f32(cursor)?;
    Ok(Corner { x, y })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    #[test]
    fn decodes_header_and_leaves_pixels_untouched() {
        let mut buf = Vec::new();
        wire::write_u32(&mut buf, 4);
        wire::write_u32(&mut buf, 2);
        for _ in 0..3 {
            wire::write_f32(&mut buf, 1.0);
            wire::write_f32(&mut buf, 2.0);
        }
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let update = decode_localmap(&buf).unwrap();
        assert_eq!(update.width, 4);
        assert_eq!(update.height, 2);
        assert_eq!(update.north_west, Corner { x: 1.0, y: 2.0 });
        assert_eq!(update.pixels, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
