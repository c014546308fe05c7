//! Cloud labeling: group cloud-bit pixels into 8-connected objects with a
//! single row scan over run-length encoded segments, merging lazily across
//! rows.

use crate::mask::CLOUD_BIT;
use crate::raster::Raster;
use crate::Error;

/// A maximal horizontal span of cloud pixels. Runs of one cloud chain
/// through `next` (an index into the run arena, -1 to terminate).
#[derive(Debug, Clone, Copy)]
pub struct Run {
    pub row: u32,
    pub start_col: u32,
    pub col_count: u32,
    pub next: i32,
}

/// Labeling result: the run arena, a head-of-chain per cloud number, and
/// per-cloud pixel counts. Cloud number 0 is reserved for "no cloud"; its
/// lookup slot is -1 and its pixel count 0.
#[derive(Debug)]
pub struct CloudLabels {
    pub runs: Vec<Run>,
    pub lookup: Vec<i32>,
    pub pixel_count: Vec<u32>,
}

impl CloudLabels {
    fn empty() -> Self {
        Self { runs: Vec::new(), lookup: vec![-1], pixel_count: vec![0] }
    }

    /// Number of cloud slots, including the reserved slot 0.
    pub fn count(&self) -> usize {
        self.lookup.len()
    }

    /// Iterate the runs of one cloud.
    pub fn runs_of(&self, cloud: usize) -> RunsOf<'_> {
        RunsOf { runs: &self.runs, next: self.lookup[cloud] }
    }
}

pub struct RunsOf<'a> {
    runs: &'a [Run],
    next: i32,
}

impl<'a> Iterator for RunsOf<'a> {
    type Item = &'a Run;

    fn next(&mut self) -> Option<&'a Run> {
        if self.next < 0 {
            return None;
        }
        let run = &self.runs[self.next as usize];
        self.next = run.next;
        Some(run)
    }
}

/// Collect the maximal cloud-pixel spans of every row, in scan order.
fn collect_runs(pixel_mask: &Raster<u8>) -> Vec<Run> {
    let mut runs = Vec::new();
    for row in 0..pixel_mask.rows {
        let mask_row = pixel_mask.row(row);
        let mut col = 0;
        while col < mask_row.len() {
            if mask_row[col] & CLOUD_BIT == 0 {
                col += 1;
                continue;
            }
            let mut len = 1;
            while col + len < mask_row.len() && mask_row[col + len] & CLOUD_BIT != 0 {
                len += 1;
            }
            runs.push(Run {
                row: row as u32,
                start_col: col as u32,
                col_count: len as u32,
                next: -1,
            });
            // The pixel after the run is known non-cloud.
            col += len + 1;
        }
    }
    runs
}

/// Label the cloud objects of `pixel_mask`, painting `cloud_map` with the
/// final cloud number of every cloud pixel (0 elsewhere).
///
/// The scan visits runs top-to-bottom, left-to-right. A run overlapping the
/// previous row (with one-pixel diagonal tolerance) joins that cloud; further
/// overlaps merge into the first by renumbering the previous row and the
/// already-painted part of the current row, then splicing run chains. A final
/// pass repaints every surviving cloud with its compacted number. Same-row
/// adjacency needs no check: adjacent cloud pixels of one row are, by
/// construction, a single run.
pub fn identify_clouds(
    pixel_mask: &Raster<u8>,
    cloud_map: &mut Raster<i32>,
) -> Result<CloudLabels, Error> {
    let ncols = pixel_mask.cols;
    let mut runs = collect_runs(pixel_mask);
    if runs.is_empty() {
        return Ok(CloudLabels::empty());
    }

    let mut lookup = vec![-1i32; runs.len() + 1];
    let mut next_cloud = 1usize;

    for run_index in 0..runs.len() {
        let row = runs[run_index].row as usize;
        let start_col = runs[run_index].start_col as usize;
        let end_col = start_col + runs[run_index].col_count as usize;
        let mut assigned = 0i32;

        if row > 0 {
            // Overlap scan covers one extra column on each side for the
            // diagonal neighbours, clipped to the image.
            let scan_start = start_col.saturating_sub(1);
            let scan_end = end_col.min(ncols - 1);

            let mut col = scan_start;
            while col <= scan_end {
                let number = cloud_map.get(row - 1, col);
                if number != 0 {
                    runs[run_index].next = lookup[number as usize];
                    lookup[number as usize] = run_index as i32;
                    for v in &mut cloud_map.row_mut(row)[start_col..end_col] {
                        *v = number;
                    }
                    assigned = number;
                    break;
                }
                col += 1;
            }

            if assigned != 0 {
                // Merge any further overlapping clouds into the assigned one.
                // The map update is lazy: only the previous row and the
                // already-painted columns of this row are renumbered; the
                // final repaint fixes the rest.
                for scan_col in (col + 1)..=scan_end {
                    let other = cloud_map.get(row - 1, scan_col);
                    if other == 0 || other == assigned {
                        continue;
                    }
                    for v in cloud_map.row_mut(row - 1) {
                        if *v == other {
                            *v = assigned;
                        }
                    }
                    for v in &mut cloud_map.row_mut(row)[..scan_col] {
                        if *v == other {
                            *v = assigned;
                        }
                    }
                    let mut last = lookup[other as usize];
                    while runs[last as usize].next != -1 {
                        last = runs[last as usize].next;
                    }
                    runs[last as usize].next = lookup[assigned as usize];
                    lookup[assigned as usize] = lookup[other as usize];
                    lookup[other as usize] = -1;
                }
            }
        }

        if assigned == 0 {
            if next_cloud >= i32::MAX as usize {
                return Err(Error::Invariant("too many clouds identified".into()));
            }
            for v in &mut cloud_map.row_mut(row)[start_col..end_col] {
                *v = next_cloud as i32;
            }
            runs[run_index].next = -1;
            lookup[next_cloud] = run_index as i32;
            next_cloud += 1;
        }
    }

    // Drop merged slots.
    let mut surviving = 1usize;
    for i in 1..next_cloud {
        if lookup[i] != -1 {
            lookup[surviving] = lookup[i];
            surviving += 1;
        }
    }
    lookup.truncate(surviving);

    // Repaint the map with final cloud numbers and count pixels per cloud.
    let mut pixel_count = vec![0u32; surviving];
    for cloud in 1..surviving {
        let mut run_index = lookup[cloud];
        let mut count = 0u32;
        while run_index != -1 {
            let run = runs[run_index as usize];
            let start = run.start_col as usize;
            let end = start + run.col_count as usize;
            for v in &mut cloud_map.row_mut(run.row as usize)[start..end] {
                *v = cloud as i32;
            }
            count += run.col_count;
            run_index = run.next;
        }
        pixel_count[cloud] = count;
    }

    Ok(CloudLabels { runs, lookup, pixel_count })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> Raster<u8> {
        let h = rows.len();
        let w = rows[0].len();
        let mut m = Raster::filled(h, w, 0u8);
        for (r, line) in rows.iter().enumerate() {
            for (c, ch) in line.chars().enumerate() {
                if ch == '#' {
                    m.set(r, c, CLOUD_BIT);
                }
            }
        }
        m
    }

    fn label(rows: &[&str]) -> (CloudLabels, Raster<i32>) {
        let mask = mask_from(rows);
        let mut map = Raster::filled(mask.rows, mask.cols, 0i32);
        let labels = identify_clouds(&mask, &mut map).unwrap();
        (labels, map)
    }

    /// Every nonzero map pixel belongs to a cloud, and per-cloud pixel
    /// counts equal the map tallies.
    fn assert_map_consistent(labels: &CloudLabels, map: &Raster<i32>) {
        let mut tallies = vec![0u32; labels.count()];
        for &v in &map.data {
            assert!((v as usize) < labels.count(), "stale cloud number {v}");
            tallies[v as usize] += 1;
        }
        for cloud in 1..labels.count() {
            assert_eq!(tallies[cloud], labels.pixel_count[cloud], "cloud {cloud}");
        }
    }

    #[test]
    fn empty_mask_yields_no_clouds() {
        let (labels, map) = label(&["....", "....", "...."]);
        assert_eq!(labels.count(), 1);
        assert!(map.data.iter().all(|&v| v == 0));
    }

    #[test]
    fn single_square_is_one_cloud() {
        let (labels, map) = label(&["......", ".##...", ".##...", "......"]);
        assert_eq!(labels.count(), 2);
        assert_eq!(labels.pixel_count[1], 4);
        assert_map_consistent(&labels, &map);
    }

    #[test]
    fn diagonal_touch_is_eight_connected() {
        let (labels, map) = label(&["#....", ".#...", "..#.."]);
        assert_eq!(labels.count(), 2);
        assert_eq!(labels.pixel_count[1], 3);
        assert_map_consistent(&labels, &map);
    }

    #[test]
    fn separate_objects_get_separate_numbers() {
        let (labels, map) = label(&["##..#", ".....", "#...#"]);
        assert_eq!(labels.count(), 5);
        let total: u32 = labels.pixel_count.iter().sum();
        assert_eq!(total, 6);
        assert_map_consistent(&labels, &map);
    }

    #[test]
    fn u_shape_merges_arms_into_one_cloud() {
        let (labels, map) = label(&[
            "#...#",
            "#...#",
            "#####",
        ]);
        assert_eq!(labels.count(), 2);
        assert_eq!(labels.pixel_count[1], 9);
        assert_map_consistent(&labels, &map);
        // All pixels bear the surviving number after the repaint.
        assert_eq!(map.get(0, 0), map.get(0, 4));
    }

    #[test]
    fn multi_way_merge_in_one_run() {
        let (labels, map) = label(&[
            "#.#.#",
            "#####",
        ]);
        assert_eq!(labels.count(), 2);
        assert_eq!(labels.pixel_count[1], 8);
        assert_map_consistent(&labels, &map);
    }

    #[test]
    fn run_touching_right_edge_is_handled() {
        let (labels, map) = label(&["...##", "....#"]);
        assert_eq!(labels.count(), 2);
        assert_eq!(labels.pixel_count[1], 3);
        assert_map_consistent(&labels, &map);
    }

    #[test]
    fn runs_of_traverses_the_chain() {
        let (labels, _) = label(&["###..", ".###.", "....."]);
        let pixels: u32 = labels.runs_of(1).map(|r| r.col_count).sum();
        assert_eq!(pixels, 6);
    }
}
