//! Row-major `[rows, dim]` f32 matrix addressed by sample index.

/// Dense descriptor matrix, one row per dataset sample.
///
/// Rows are written by explicit sample index, so batches produced out of
/// order land in the right place. Rows never written stay zero.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorMatrix {
    data: Vec<f32>,
    rows: usize,
    dim: usize,
}

impl DescriptorMatrix {
    /// Allocate a zero-filled matrix.
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            data: vec![0.0; rows * dim],
            rows,
            dim,
        }
    }

    /// Wrap an existing row-major buffer.
    pub fn from_vec(data: Vec<f32>, rows: usize, dim: usize) -> anyhow::Result<Self> {
        if data.len() != rows * dim {
            anyhow::bail!(
                "buffer of length {} does not match shape [{rows}, {dim}]",
                data.len()
            );
        }
        Ok(Self { data, rows, dim })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Borrow row `index`.
    ///
    /// # Panics
    /// Panics if `index >= rows`.
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    /// Scatter a `[indices.len(), dim]` block into the rows named by `indices`.
    pub fn write_rows(&mut self, indices: &[usize], values: &[f32]) -> anyhow::Result<()> {
        if values.len() != indices.len() * self.dim {
            anyhow::bail!(
                "got {} values for {} rows of dim {}",
                values.len(),
                indices.len(),
                self.dim
            );
        }
        for (src, &row) in values.chunks_exact(self.dim.max(1)).zip(indices) {
            if row >= self.rows {
                anyhow::bail!("row index {row} out of bounds for {} rows", self.rows);
            }
            self.data[row * self.dim..(row + 1) * self.dim].copy_from_slice(src);
        }
        Ok(())
    }

    /// Split into leading rows `[0, at)` and trailing rows `[at, rows)`.
    ///
    /// For an evaluation set this yields `(gallery, queries)`.
    pub fn split_rows(&self, at: usize) -> anyhow::Result<(DescriptorRows<'_>, DescriptorRows<'_>)> {
        if at > self.rows {
            anyhow::bail!("cannot split {} rows at {at}", self.rows);
        }
        let (head, tail) = self.data.split_at(at * self.dim);
        Ok((
            DescriptorRows { data: head, dim: self.dim },
            DescriptorRows { data: tail, dim: self.dim },
        ))
    }

    /// Borrow every row.
    pub fn all_rows(&self) -> DescriptorRows<'_> {
        DescriptorRows { data: &self.data, dim: self.dim }
    }

    /// Number of rows with at least one non-zero component.
    pub fn nonzero_rows(&self) -> usize {
        if self.dim == 0 {
            return 0;
        }
        self.data
            .chunks_exact(self.dim)
            .filter(|row| row.iter().any(|&v| v != 0.0))
            .count()
    }
}

/// Borrowed contiguous block of descriptor rows.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorRows<'a> {
    data: &'a [f32],
    dim: usize,
}

impl<'a> DescriptorRows<'a> {
    pub fn new(data: &'a [f32], dim: usize) -> anyhow::Result<Self> {
        if dim == 0 || data.len() % dim != 0 {
            anyhow::bail!("buffer of length {} is not a whole number of dim-{dim} rows", data.len());
        }
        Ok(Self { data, dim })
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }

    pub fn row(&self, index: usize) -> &'a [f32] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [f32]> {
        self.data.chunks_exact(self.dim.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_rows_by_index() {
        let mut m = DescriptorMatrix::zeros(4, 2);
        m.write_rows(&[3, 1], &[1.0, 2.0, 3.0, 4.0]).unwrap();

        assert_eq!(m.row(0), &[0.0, 0.0]);
        assert_eq!(m.row(1), &[3.0, 4.0]);
        assert_eq!(m.row(2), &[0.0, 0.0]);
        assert_eq!(m.row(3), &[1.0, 2.0]);
        assert_eq!(m.nonzero_rows(), 2);
    }

    #[test]
    fn test_write_rows_rejects_bad_shapes() {
        let mut m = DescriptorMatrix::zeros(2, 3);
        assert!(m.write_rows(&[0], &[1.0, 2.0]).is_err());
        assert!(m.write_rows(&[5], &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_split_rows() {
        let m = DescriptorMatrix::from_vec((0..10).map(|v| v as f32).collect(), 5, 2).unwrap();
        let (gallery, queries) = m.split_rows(3).unwrap();

        assert_eq!(gallery.len(), 3);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries.row(0), &[6.0, 7.0]);
        assert_eq!(gallery.iter().count(), 3);
        assert!(m.split_rows(6).is_err());
    }

    #[test]
    fn test_from_vec_shape_mismatch() {
        assert!(DescriptorMatrix::from_vec(vec![0.0; 5], 2, 3).is_err());
    }
}
