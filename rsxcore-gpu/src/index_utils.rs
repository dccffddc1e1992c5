// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Index synthesis for primitives the host cannot draw directly.

/// RSX primitive topologies as encoded in `SET_BEGIN_END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimitiveType {
    Points = 1,
    Lines = 2,
    LineLoop = 3,
    LineStrip = 4,
    Triangles = 5,
    TriangleStrip = 6,
    TriangleFan = 7,
    Quads = 8,
    QuadStrip = 9,
    Polygon = 10,
}

impl PrimitiveType {
    pub fn from_raw(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Points,
            2 => Self::Lines,
            3 => Self::LineLoop,
            4 => Self::LineStrip,
            5 => Self::Triangles,
            6 => Self::TriangleStrip,
            7 => Self::TriangleFan,
            8 => Self::Quads,
            9 => Self::QuadStrip,
            10 => Self::Polygon,
            _ => return None,
        })
    }
}

/// True if the host draws `primitive` without an emulated index buffer.
pub fn is_primitive_native(primitive: PrimitiveType) -> bool {
    matches!(
        primitive,
        PrimitiveType::Points
            | PrimitiveType::Lines
            | PrimitiveType::LineStrip
            | PrimitiveType::Triangles
            | PrimitiveType::TriangleStrip
    )
}

/// Number of indices needed to draw `vertex_count` vertices of a non-native
/// primitive as a list.
pub fn get_index_count(primitive: PrimitiveType, vertex_count: u32) -> u32 {
    match primitive {
        PrimitiveType::LineLoop => {
            if vertex_count == 0 {
                0
            } else {
                vertex_count + 1
            }
        }
        PrimitiveType::TriangleFan | PrimitiveType::Polygon => vertex_count.saturating_sub(2) * 3,
        PrimitiveType::Quads => (vertex_count / 4) * 6,
        PrimitiveType::QuadStrip => (vertex_count.saturating_sub(2) / 2) * 6,
        _ => panic!("get_index_count: {:?} is a native primitive", primitive),
    }
}

/// Byte size of the emulated u16 index buffer.
pub fn get_index_buffer_size(primitive: PrimitiveType, vertex_count: u32) -> usize {
    get_index_count(primitive, vertex_count) as usize * std::mem::size_of::<u16>()
}

/// Fill `dst` with list indices for `vertex_count` vertices of `primitive`.
///
/// `dst` must hold at least `get_index_count` entries.
pub fn write_index_array(dst: &mut [u16], primitive: PrimitiveType, vertex_count: u32) {
    let needed = get_index_count(primitive, vertex_count) as usize;
    assert!(
        dst.len() >= needed,
        "index buffer too small: {} < {}",
        dst.len(),
        needed
    );
    if needed == 0 {
        return;
    }

    match primitive {
        PrimitiveType::LineLoop => {
            for i in 0..vertex_count {
                dst[i as usize] = i as u16;
            }
            dst[vertex_count as usize] = 0;
        }
        PrimitiveType::TriangleFan | PrimitiveType::Polygon => {
            for (i, tri) in dst[..needed].chunks_exact_mut(3).enumerate() {
                let i = i as u16;
                tri.copy_from_slice(&[0, i + 1, i + 2]);
            }
        }
        PrimitiveType::Quads => {
            for (i, quad) in dst[..needed].chunks_exact_mut(6).enumerate() {
                let base = (i * 4) as u16;
                quad.copy_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
            }
        }
        PrimitiveType::QuadStrip => {
            for (i, quad) in dst[..needed].chunks_exact_mut(6).enumerate() {
                let base = (i * 2) as u16;
                quad.copy_from_slice(&[base, base + 1, base + 2, base + 2, base + 1, base + 3]);
            }
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(primitive: PrimitiveType, count: u32) -> Vec<u16> {
        let mut buf = vec![0xFFFF; get_index_count(primitive, count) as usize];
        write_index_array(&mut buf, primitive, count);
        buf
    }

    #[test]
    fn test_native_classification() {
        assert!(is_primitive_native(PrimitiveType::Triangles));
        assert!(is_primitive_native(PrimitiveType::Points));
        assert!(!is_primitive_native(PrimitiveType::Quads));
        assert!(!is_primitive_native(PrimitiveType::LineLoop));
        assert_eq!(PrimitiveType::from_raw(8), Some(PrimitiveType::Quads));
        assert_eq!(PrimitiveType::from_raw(0), None);
        assert_eq!(PrimitiveType::from_raw(11), None);
    }

    #[test]
    fn test_index_counts() {
        assert_eq!(get_index_count(PrimitiveType::LineLoop, 4), 5);
        assert_eq!(get_index_count(PrimitiveType::TriangleFan, 5), 9);
        assert_eq!(get_index_count(PrimitiveType::Polygon, 2), 0);
        assert_eq!(get_index_count(PrimitiveType::Quads, 8), 12);
        assert_eq!(get_index_count(PrimitiveType::QuadStrip, 6), 12);
        assert_eq!(get_index_buffer_size(PrimitiveType::Quads, 4), 12);
    }

    #[test]
    fn test_line_loop_closes() {
        assert_eq!(indices(PrimitiveType::LineLoop, 3), vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_fan_and_polygon() {
        assert_eq!(
            indices(PrimitiveType::TriangleFan, 5),
            vec![0, 1, 2, 0, 2, 3, 0, 3, 4]
        );
        assert_eq!(indices(PrimitiveType::Polygon, 4), vec![0, 1, 2, 0, 2, 3]);
    }

    #[test]
    fn test_quads() {
        assert_eq!(
            indices(PrimitiveType::Quads, 8),
            vec![0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4]
        );
    }

    #[test]
    fn test_quad_strip() {
        assert_eq!(
            indices(PrimitiveType::QuadStrip, 6),
            vec![0, 1, 2, 2, 1, 3, 2, 3, 4, 4, 3, 5]
        );
    }

    #[test]
    #[should_panic(expected = "native primitive")]
    fn test_native_rejected() {
        get_index_count(PrimitiveType::Triangles, 3);
    }
}
