use std::ops::Range;

/// One rectangular block of a raster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl Block {
    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.cols.len()
    }
}

/// Fixed-size tiling of a `height x width` raster into independent blocks.
/// Edge blocks are truncated to the raster bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub height: usize,
    pub width: usize,
    pub block_size: usize,
}

impl BlockLayout {
    pub fn new(height: usize, width: usize, block_size: usize) -> Self {
        Self {
            height,
            width,
            block_size: block_size.max(1),
        }
    }

    pub fn block_rows(&self) -> usize {
        self.height.div_ceil(self.block_size)
    }

    pub fn block_cols(&self) -> usize {
        self.width.div_ceil(self.block_size)
    }

    pub fn block_count(&self) -> usize {
        self.block_rows() * self.block_cols()
    }

    /// Blocks in row-major order
    pub fn blocks(&self) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(self.block_count());
        for br in 0..self.block_rows() {
            let r0 = br * self.block_size;
            let r1 = (r0 + self.block_size).min(self.height);
            for bc in 0..self.block_cols() {
                let c0 = bc * self.block_size;
                let c1 = (c0 + self.block_size).min(self.width);
                blocks.push(Block { rows: r0..r1, cols: c0..c1 });
            }
        }
        blocks
    }
}
