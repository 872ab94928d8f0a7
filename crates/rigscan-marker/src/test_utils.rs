//! Synthetic marker rendering for tests.

use rigscan_core::Rgb;

/// Raw 3x3 code grid (row-major, 1 = white) for a 4-bit id: the id bits
/// MSB-first, their bitwise inverse, and the parity cell.
pub fn cells_for_id(id: u8) -> [u8; 9] {
    let mut vals = [0u8; 9];
    let mut ones = 0;
    for i in 0..4 {
        let bit = (id >> (3 - i)) & 1;
        vals[i] = bit;
        vals[i + 4] = 1 - bit;
        ones += bit;
    }
    vals[8] = ones % 2;
    vals
}

/// Render a marker with the given id into a black RGB frame: white
/// pentagon silhouette with the code cells in the interior square.
/// `scale` is pixels per normalized unit, `center` the silhouette origin.
pub fn render_marker(
    id: u8,
    scale: f32,
    center: (f32, f32),
    width: usize,
    height: usize,
) -> Vec<Rgb> {
    render_marker_cells(cells_for_id(id), scale, center, width, height)
}

/// Render a marker from a raw (possibly invalid) cell grid.
pub fn render_marker_cells(
    vals: [u8; 9],
    scale: f32,
    center: (f32, f32),
    width: usize,
    height: usize,
) -> Vec<Rgb> {
    let mut frame = vec![Rgb::BLACK; width * height];

    for y in 0..height {
        for x in 0..width {
            let nx = (x as f32 - center.0) / scale;
            let ny = (y as f32 - center.1) / scale;

            if !inside_pentagon(nx, ny) {
                continue;
            }

            let mut white = true;
            if nx.abs() < 0.6 && ny.abs() < 0.6 {
                let col = (((nx + 0.6) / 0.4) as usize).min(2);
                let row = (((ny + 0.6) / 0.4) as usize).min(2);
                white = vals[row * 3 + col] == 1;
            }

            if white {
                frame[y * width + x] = Rgb::new(255, 255, 255);
            }
        }
    }

    frame
}

/// The silhouette is the bounding rectangle minus the concave notch
/// triangle {(0,1), (-1,5/3), (1,5/3)}.
fn inside_pentagon(x: f32, y: f32) -> bool {
    if !(-1.0..=1.0).contains(&x) || !(-1.0..=1.6667).contains(&y) {
        return false;
    }
    let notch = y > 1.0 + x.abs() * 0.6667;
    !notch
}
