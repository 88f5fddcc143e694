use burn::prelude::*;

/// Nearest-neighbour volumetric upsampling by an integer factor.
#[derive(Debug, Clone, Copy)]
pub struct Upsample3d {
    scale_factor: usize,
}

impl Upsample3d {
    pub fn new(scale_factor: usize) -> Self {
        Self { scale_factor }
    }

    /// [B, C, D, H, W] -> [B, C, D*s, H*s, W*s]
    pub fn forward<B: Backend>(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let s = self.scale_factor;
        if s == 1 {
            return x;
        }
        let [batch, channels, depth, height, width] = x.dims();

        // One axis at a time so no intermediate exceeds rank 6.
        let x: Tensor<B, 6> = x.reshape([batch, channels, depth, 1, height, width]);
        let x: Tensor<B, 6> = x
            .repeat_dim(3, s)
            .reshape([batch, channels, depth * s, height, 1, width]);
        let x: Tensor<B, 6> = x
            .repeat_dim(4, s)
            .reshape([batch, channels, depth * s, height * s, width, 1]);

        x.repeat_dim(5, s)
            .reshape([batch, channels, depth * s, height * s, width * s])
    }
}
