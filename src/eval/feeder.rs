//! Pull-style producers of successive `[batch, len]` token blocks.

use anyhow::{bail, ensure};
use ndarray::{s, Array2};

/// Yields the next block of `len` time-steps for every row of the batch.
pub trait Feeder {
    fn next_block(&mut self, len: usize) -> anyhow::Result<Array2<u32>>;
}

impl<F: Feeder + ?Sized> Feeder for &mut F {
    fn next_block(&mut self, len: usize) -> anyhow::Result<Array2<u32>> {
        (**self).next_block(len)
    }
}

/// Walks a fixed `[batch, length]` matrix column-block by column-block.
#[derive(Clone, Debug)]
pub struct SequenceFeeder {
    data: Array2<u32>,
    cursor: usize,
}

impl SequenceFeeder {
    pub fn new(data: Array2<u32>) -> Self {
        Self { data, cursor: 0 }
    }

    /// Lay a flat token stream into `batch` contiguous rows, dropping the tail
    /// that does not fill a full column.
    pub fn from_stream(tokens: &[u32], batch: usize) -> anyhow::Result<Self> {
        ensure!(batch > 0, "batch size must be positive");
        let len = tokens.len() / batch;
        ensure!(len > 0, "{} tokens cannot fill {batch} rows", tokens.len());
        let data = Array2::from_shape_vec((batch, len), tokens[..batch * len].to_vec())?;
        Ok(Self::new(data))
    }

    /// Input and target feeders over the same stream, targets shifted by one.
    pub fn pair(tokens: &[u32], batch: usize) -> anyhow::Result<(Self, Self)> {
        ensure!(tokens.len() > 1, "need at least two tokens to form targets");
        let n = tokens.len() - 1;
        Ok((
            Self::from_stream(&tokens[..n], batch)?,
            Self::from_stream(&tokens[1..], batch)?,
        ))
    }

    pub fn batch_size(&self) -> usize {
        self.data.nrows()
    }

    /// Columns not yet fed.
    pub fn remaining(&self) -> usize {
        self.data.ncols() - self.cursor
    }

    /// Whole blocks of `stride` columns in one pass.
    pub fn epoch_size(&self, stride: usize) -> usize {
        if stride == 0 {
            0
        } else {
            self.data.ncols() / stride
        }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl Feeder for SequenceFeeder {
    fn next_block(&mut self, len: usize) -> anyhow::Result<Array2<u32>> {
        if len > self.remaining() {
            bail!(
                "feeder exhausted: requested {len} steps, {} remaining",
                self.remaining()
            );
        }
        let block = self.data.slice(s![.., self.cursor..self.cursor + len]).to_owned();
        self.cursor += len;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_from_stream_rows_are_contiguous() {
        let f = SequenceFeeder::from_stream(&[0, 1, 2, 3, 4, 5, 6], 2).unwrap();
        assert_eq!(f.batch_size(), 2);
        assert_eq!(f.remaining(), 3);
        assert_eq!(f.data, array![[0u32, 1, 2], [3, 4, 5]]);
    }

    #[test]
    fn test_pair_shifts_targets() {
        let (mut x, mut y) = SequenceFeeder::pair(&[10, 11, 12, 13, 14], 2).unwrap();
        assert_eq!(x.next_block(2).unwrap(), array![[10u32, 11], [12, 13]]);
        assert_eq!(y.next_block(2).unwrap(), array![[11u32, 12], [13, 14]]);
    }

    #[test]
    fn test_blocks_advance_then_exhaust() {
        let mut f = SequenceFeeder::new(array![[1u32, 2, 3, 4, 5]]);
        assert_eq!(f.epoch_size(2), 2);
        assert_eq!(f.next_block(2).unwrap(), array![[1u32, 2]]);
        assert_eq!(f.next_block(2).unwrap(), array![[3u32, 4]]);
        let err = f.next_block(2).unwrap_err();
        assert!(err.to_string().contains("exhausted"));

        f.rewind();
        assert_eq!(f.remaining(), 5);
    }

    #[test]
    fn test_degenerate_streams_rejected() {
        assert!(SequenceFeeder::from_stream(&[1, 2], 0).is_err());
        assert!(SequenceFeeder::from_stream(&[1], 2).is_err());
        assert!(SequenceFeeder::pair(&[1], 1).is_err());
    }
}
