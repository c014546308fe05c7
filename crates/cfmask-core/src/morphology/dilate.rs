//! Square-window bit dilation over the pixel mask.

use rayon::prelude::*;

use crate::mask::FILL_BIT;
use crate::raster::Raster;

/// Dilate `bit` from `source` into `dest` with a (2*radius+1)^2 window.
///
/// For every non-fill destination pixel the bit is set when any source pixel
/// in the window carries it, and cleared otherwise: the destination's prior
/// candidate bits are replaced by the dilated source, which is how matched
/// shadows (and filtered clouds) supersede the potential-mask candidates.
pub fn dilate_bit(source: &Raster<u8>, dest: &mut Raster<u8>, radius: usize, bit: u8) {
    let rows = source.rows;
    let cols = source.cols;

    dest.data
        .par_chunks_mut(cols)
        .enumerate()
        .for_each(|(row, dest_row)| {
            let w_row_start = row.saturating_sub(radius);
            let w_row_end = (row + radius).min(rows - 1);

            for (col, out) in dest_row.iter_mut().enumerate() {
                if *out & FILL_BIT != 0 {
                    continue;
                }

                // The centre pixel answers most queries without a window scan.
                if source.get(row, col) & bit != 0 {
                    *out |= bit;
                    continue;
                }

                let w_col_start = col.saturating_sub(radius);
                let w_col_end = (col + radius).min(cols - 1);
                let mut found = false;
                'window: for w_row in w_row_start..=w_row_end {
                    let src_row = source.row(w_row);
                    for src in &src_row[w_col_start..=w_col_end] {
                        if src & bit != 0 {
                            found = true;
                            break 'window;
                        }
                    }
                }

                if found {
                    *out |= bit;
                } else {
                    *out &= !bit;
                }
            }
        });
}
