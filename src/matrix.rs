//! Rectangular matrices over [`Zp`] with Gaussian elimination.
//!
//! Cells are addressed `(column, row)` and stored row-major.  The only
//! consumer is rational function interpolation, which builds an
//! `(mbar + 1) x mbar` augmented system and reads the solution back from the
//! last column after [`Matrix::reduce`].

use std::fmt;

use crate::error::ReconError;
use crate::field::Zp;

/// A `columns x rows` matrix of field elements.
#[derive(Clone, PartialEq, Eq)]
pub struct Matrix {
    columns: usize,
    rows: usize,
    cells: Vec<Zp>,
}

impl Matrix {
    /// Creates a matrix with every cell set to `fill`.
    pub fn new(columns: usize, rows: usize, fill: Zp) -> Self {
        Matrix {
            columns,
            rows,
            cells: vec![fill; columns * rows],
        }
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Reads the cell at `(col, row)`.
    pub fn get(&self, col: usize, row: usize) -> &Zp {
        &self.cells[col + row * self.columns]
    }

    /// Writes the cell at `(col, row)`.
    pub fn set(&mut self, col: usize, row: usize, value: Zp) {
        self.cells[col + row * self.columns] = value;
    }

    /// Reduces the system in place: forward elimination then
    /// back-substitution from the bottom row upward.
    ///
    /// Fails with [`ReconError::MatrixTooNarrow`] when there are fewer
    /// columns than rows.
    pub fn reduce(&mut self) -> Result<(), ReconError> {
        if self.columns < self.rows {
            return Err(ReconError::MatrixTooNarrow {
                columns: self.columns,
                rows: self.rows,
            });
        }
        for j in 0..self.rows {
            self.process_row_forward(j)?;
        }
        for j in (1..self.rows).rev() {
            self.back_substitute(j);
        }
        Ok(())
    }

    fn process_row_forward(&mut self, j: usize) -> Result<(), ReconError> {
        if self.get(j, j).is_zero() {
            let Some(swap) = (j + 1..self.rows).find(|&r| !self.get(j, r).is_zero()) else {
                return Ok(());
            };
            self.swap_rows(j, swap);
        }
        let pivot = self.get(j, j).clone();
        if !pivot.is_one() {
            self.scmult_row(j, j, &pivot.inv()?);
        }
        for j2 in j + 1..self.rows {
            let scmult = self.get(j, j2).clone();
            self.rowsub(j, j, j2, &scmult);
        }
        Ok(())
    }

    fn back_substitute(&mut self, j: usize) {
        if !self.get(j, j).is_one() {
            return;
        }
        let last = self.rows - 1;
        for j2 in (0..j).rev() {
            let scmult = self.get(j, j2).clone();
            self.rowsub(last, j, j2, &scmult);
            let zero = Zp::zero(scmult.modulus());
            self.set(j, j2, zero);
        }
    }

    /// Exchanges two rows.
    pub fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for i in 0..self.columns {
            self.cells.swap(a * self.columns + i, b * self.columns + i);
        }
    }

    /// Multiplies row `j` by `sc`, from column `scol` onward.
    pub fn scmult_row(&mut self, scol: usize, j: usize, sc: &Zp) {
        let start = j * self.columns;
        for cell in &mut self.cells[start + scol..start + self.columns] {
            *cell = &*cell * sc;
        }
    }

    /// Subtracts `scmult * row[src]` from `row[dst]`, from column `scol`
    /// onward.
    pub fn rowsub(&mut self, scol: usize, src: usize, dst: usize, scmult: &Zp) {
        for i in scol..self.columns {
            let sval = self.get(i, src).clone();
            if sval.is_zero() {
                continue;
            }
            let delta = if scmult.is_one() { sval } else { &sval * scmult };
            let v = self.get(i, dst) - &delta;
            self.set(i, dst, v);
        }
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..self.rows {
            f.write_str("| ")?;
            for col in 0..self.columns {
                write!(f, "{} ", self.get(col, row))?;
            }
            f.write_str("|\n")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matrix {}x{}\n{self}", self.columns, self.rows)
    }
}
