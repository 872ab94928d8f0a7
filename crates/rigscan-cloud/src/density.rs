use rigscan_core::Point3f;
use std::collections::HashMap;

/// Largest voxel index magnitude representable in the 21-bit-per-axis key.
const MAX_VOXEL_INDEX: i64 = 1 << 20;

#[inline]
fn voxel_key(x: i64, y: i64, z: i64) -> u64 {
    ((x as u64) & 0x1F_FFFF) << 42 | ((y as u64) & 0x1F_FFFF) << 21 | ((z as u64) & 0x1F_FFFF)
}

/// Density cull: hash every valid vertex into a coarse voxel and invalidate
/// the ones whose voxel holds fewer than `min_points` occupants.
///
/// The key packs 21 bits per axis, which covers voxel indices in
/// `(-2^20, 2^20)`; with the default 6 mm voxel that is several kilometres
/// of range. Points beyond it are invalidated rather than aliased.
pub fn mark_sparse_voxels(vertices: &mut [Point3f], voxel_size: f32, min_points: usize) {
    let mut counts: HashMap<u64, usize> = HashMap::new();
    let mut keys = vec![0u64; vertices.len()];

    for (i, p) in vertices.iter_mut().enumerate() {
        if p.invalid {
            continue;
        }

        let vx = (p.x / voxel_size).floor() as i64;
        let vy = (p.y / voxel_size).floor() as i64;
        let vz = (p.z / voxel_size).floor() as i64;

        if vx.abs() >= MAX_VOXEL_INDEX || vy.abs() >= MAX_VOXEL_INDEX || vz.abs() >= MAX_VOXEL_INDEX
        {
            *p = Point3f::invalid();
            continue;
        }

        let key = voxel_key(vx, vy, vz);
        keys[i] = key;
        *counts.entry(key).or_insert(0) += 1;
    }

    for (i, p) in vertices.iter_mut().enumerate() {
        if !p.invalid && counts.get(&keys[i]).copied().unwrap_or(0) < min_points {
            *p = Point3f::invalid();
        }
    }
}
