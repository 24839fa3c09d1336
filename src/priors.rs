use burn::{
    prelude::Backend,
    tensor::{Device, Int, Tensor},
};

use crate::compiler::ScaleFactor;

/// Cell centres `(i + 0.5) * scale` for `i in 0..steps`.
pub fn cell_centres<B: Backend>(steps: usize, scale: ScaleFactor, device: &Device<B>) -> Tensor<B, 1> {
    Tensor::<B, 1, Int>::arange(0..steps as i64, device)
        .float()
        .add_scalar(0.5)
        .mul_scalar(scale.value())
}

/// Image-space coordinates of every cell of a `[batch, _, rows, cols]` feature
/// map, each shaped `[batch, 1, rows, cols]` so they line up with one channel.
#[derive(Debug, Clone)]
pub struct PriorGrid<B: Backend> {
    /// y coordinate of each cell.
    pub rows: Tensor<B, 4>,
    /// x coordinate of each cell.
    pub cols: Tensor<B, 4>,
}

impl<B: Backend> PriorGrid<B> {
    /// Priors for a feature map of shape `dims` at stride `scale`.
    ///
    pub fn new(dims: [usize; 4], scale: ScaleFactor, device: &Device<B>) -> Self {
        let [batch, _, rows, cols] = dims;

        let row_centres = cell_centres::<B>(rows, scale, device)
            .reshape([1, 1, rows, 1])
            .repeat(&[batch, 1, 1, cols]);
        let col_centres = cell_centres::<B>(cols, scale, device)
            .reshape([1, 1, 1, cols])
            .repeat(&[batch, 1, rows, 1]);

        Self {
            rows: row_centres,
            cols: col_centres,
        }
    }

    /// Priors matching the feature map `y`.
    pub fn for_map(y: &Tensor<B, 4>, scale: ScaleFactor) -> Self {
        Self::new(y.dims(), scale, &y.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;
    type FT = burn::tensor::ops::FloatElem<B>;

    #[test]
    pub fn test_cell_centres() {
        let device = &NdArrayDevice::default();
        let centres = cell_centres::<B>(4, ScaleFactor::from_log2(3), device);

        Tensor::<B, 1>::from_data([4.0, 12.0, 20.0, 28.0], device)
            .into_data()
            .assert_approx_eq::<FT>(&centres.to_data(), burn::tensor::Tolerance::default());
    }

    #[test]
    pub fn test_prior_grid() {
        let device = &NdArrayDevice::default();
        let grid = PriorGrid::<B>::new([2, 7, 2, 3], ScaleFactor::from_log2(1), device);

        assert_eq!(grid.rows.dims(), [2, 1, 2, 3]);
        assert_eq!(grid.cols.dims(), [2, 1, 2, 3]);

        Tensor::<B, 4>::from_data([[[[1.0, 1.0, 1.0], [3.0, 3.0, 3.0]]]], device)
            .into_data()
            .assert_approx_eq::<FT>(
                &grid.rows.clone().narrow(0, 1, 1).to_data(),
                burn::tensor::Tolerance::default(),
            );
        Tensor::<B, 4>::from_data([[[[1.0, 3.0, 5.0], [1.0, 3.0, 5.0]]]], device)
            .into_data()
            .assert_approx_eq::<FT>(
                &grid.cols.narrow(0, 0, 1).to_data(),
                burn::tensor::Tolerance::default(),
            );
    }
}
