//! Card pool generation and the win predicate.
//!
//! Both are pure: the engine is the authoritative caller, clients may run the
//! same predicate for optimistic rendering without being trusted.

use rand::seq::SliceRandom;

use crate::{
    dao::models::{CardGrid, FREE_CELL, GRID_SIZE},
    state::round::{CENTER, MarkSet},
};

/// Numbers each column draws from: column `c` covers `[15c+1, 15c+15]`.
const COLUMN_SPAN: u8 = 15;

/// Generate `size` distinct 5x5 grids.
///
/// Two grids are distinct when they differ in at least one cell. Collisions
/// are regenerated; with five-from-fifteen draws per column the grid space
/// dwarfs any realistic pool size, so the retry loop terminates immediately
/// in practice.
pub fn generate_pool(size: usize) -> Vec<CardGrid> {
    let mut pool: Vec<CardGrid> = Vec::with_capacity(size);
    while pool.len() < size {
        let candidate = generate_grid();
        if !pool.contains(&candidate) {
            pool.push(candidate);
        }
    }
    pool
}

/// Generate one grid with the standard column ranges and a free center.
fn generate_grid() -> CardGrid {
    let mut rng = rand::rng();
    let mut grid = [[0u8; GRID_SIZE]; GRID_SIZE];

    for col in 0..GRID_SIZE {
        let low = col as u8 * COLUMN_SPAN + 1;
        let mut values: Vec<u8> = (low..low + COLUMN_SPAN).collect();
        values.shuffle(&mut rng);
        for row in 0..GRID_SIZE {
            grid[row][col] = values[row];
        }
    }

    grid[usize::from(CENTER.0)][usize::from(CENTER.1)] = FREE_CELL;
    grid
}

/// True iff a full row, full column, or either diagonal is marked.
///
/// The center counts as marked whether or not it appears in `marks`. No
/// partial patterns (four corners and the like) are recognized.
pub fn has_bingo(marks: &MarkSet) -> bool {
    let marked = |row: u8, col: u8| (row, col) == CENTER || marks.contains(&(row, col));
    let span = 0..GRID_SIZE as u8;

    let any_row = span.clone().any(|row| span.clone().all(|col| marked(row, col)));
    let any_col = span.clone().any(|col| span.clone().all(|row| marked(row, col)));
    let main_diag = span.clone().all(|i| marked(i, i));
    let anti_diag = span.clone().all(|i| marked(i, GRID_SIZE as u8 - 1 - i));

    any_row || any_col || main_diag || anti_diag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(coordinates: &[(u8, u8)]) -> MarkSet {
        coordinates.iter().copied().collect()
    }

    fn full_row(row: u8) -> Vec<(u8, u8)> {
        (0..GRID_SIZE as u8).map(|col| (row, col)).collect()
    }

    fn full_col(col: u8) -> Vec<(u8, u8)> {
        (0..GRID_SIZE as u8).map(|row| (row, col)).collect()
    }

    #[test]
    fn every_row_and_column_wins() {
        for index in 0..GRID_SIZE as u8 {
            assert!(has_bingo(&marks(&full_row(index))), "row {index}");
            assert!(has_bingo(&marks(&full_col(index))), "col {index}");
        }
    }

    #[test]
    fn both_diagonals_win() {
        let main: Vec<_> = (0..GRID_SIZE as u8).map(|i| (i, i)).collect();
        let anti: Vec<_> = (0..GRID_SIZE as u8)
            .map(|i| (i, GRID_SIZE as u8 - 1 - i))
            .collect();
        assert!(has_bingo(&marks(&main)));
        assert!(has_bingo(&marks(&anti)));
    }

    #[test]
    fn center_completes_lines_through_it() {
        // Row 2 without its center cell still wins because center is free.
        let mut row = full_row(2);
        row.retain(|&coordinate| coordinate != CENTER);
        assert!(has_bingo(&marks(&row)));
    }

    #[test]
    fn four_of_five_is_not_a_win() {
        // Drop the first cell of each line; that cell is never the free
        // center, so every 4-of-5 here must lose.
        for index in 0..GRID_SIZE as u8 {
            let mut row = full_row(index);
            row.remove(0);
            assert!(!has_bingo(&marks(&row)), "row {index}");

            let mut col = full_col(index);
            col.remove(0);
            assert!(!has_bingo(&marks(&col)), "col {index}");
        }
    }

    #[test]
    fn dense_scatter_without_a_line_is_not_a_win() {
        // Mark all 25 cells, then punch one hole in every row, column, and
        // diagonal; the free center cannot repair any of them.
        let mut scatter = MarkSet::new();
        for row in 0..GRID_SIZE as u8 {
            for col in 0..GRID_SIZE as u8 {
                scatter.insert((row, col));
            }
        }
        let holes = [
            (0, 0),
            (1, 1),
            (3, 3),
            (4, 4), // main diagonal
            (0, 4),
            (1, 3),
            (3, 1),
            (4, 0), // anti diagonal
            (2, 0), // row 2
            (0, 2), // col 2
        ];
        for hole in holes {
            scatter.remove(&hole);
        }

        assert!(!has_bingo(&scatter));
    }

    #[test]
    fn empty_marks_do_not_win() {
        assert!(!has_bingo(&MarkSet::new()));
    }

    #[test]
    fn generated_grids_use_column_ranges_and_free_center() {
        let pool = generate_pool(8);
        assert_eq!(pool.len(), 8);

        for grid in &pool {
            for (row_index, row) in grid.iter().enumerate() {
                for (col_index, &value) in row.iter().enumerate() {
                    if (row_index, col_index)
                        == (usize::from(CENTER.0), usize::from(CENTER.1))
                    {
                        assert_eq!(value, FREE_CELL);
                        continue;
                    }
                    let low = col_index as u8 * COLUMN_SPAN + 1;
                    assert!(
                        (low..low + COLUMN_SPAN).contains(&value),
                        "column {col_index} value {value} out of range"
                    );
                }
            }

            // Column values are distinct within each grid.
            for col in 0..GRID_SIZE {
                let mut seen = std::collections::HashSet::new();
                for row in 0..GRID_SIZE {
                    if (row, col) == (usize::from(CENTER.0), usize::from(CENTER.1)) {
                        continue;
                    }
                    assert!(seen.insert(grid[row][col]), "duplicate in column {col}");
                }
            }
        }
    }

    #[test]
    fn generated_pool_has_no_duplicate_grids() {
        let pool = generate_pool(30);
        for (i, first) in pool.iter().enumerate() {
            for second in pool.iter().skip(i + 1) {
                assert_ne!(first, second);
            }
        }
    }
}
