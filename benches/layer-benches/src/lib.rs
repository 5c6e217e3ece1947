use anyhow::Result;
use dnn_layers::{
    factory::LayerFactory,
    layer::{
        Conv2dParams, Convolution2D, Linear, LinearParams, MaxPool, Pool2dParams, Relu, Relu4d,
        Softmax2D, SoftmaxParams,
    },
};
use ndarray::{Array1, Array4};

/// LeNet5 over plain buffers, forward and backward.
pub struct LeNet5 {
    batch_size: usize,
    conv1: Conv2dParams,
    pool1: Pool2dParams,
    conv2: Conv2dParams,
    pool2: Pool2dParams,
    dense1: LinearParams,
    dense2: LinearParams,
    dense3: LinearParams,
    w: [Vec<f32>; 5],
    b: [Vec<f32>; 5],
    x: Vec<f32>,
}

fn init(len: usize) -> Vec<f32> {
    let scale = 1. / (len as f32).sqrt();
    (0..len).map(|i| ((i * 7919 % 97) as f32 / 97. - 0.5) * scale).collect()
}

impl LeNet5 {
    pub fn new(batch_size: usize) -> Self {
        let conv1 = Conv2dParams::new([batch_size, 1, 28, 28], [6, 1, 5, 5]).with_bias(Some(6));
        let pool1 = Pool2dParams::new([batch_size, 6, 24, 24], [2, 2]);
        let conv2 = Conv2dParams::new([batch_size, 6, 12, 12], [16, 6, 5, 5]).with_bias(Some(16));
        let pool2 = Pool2dParams::new([batch_size, 16, 8, 8], [2, 2]);
        let dense1 = LinearParams::new([batch_size, 256], [128, 256]).with_bias(Some(128));
        let dense2 = LinearParams::new([batch_size, 128], [84, 128]).with_bias(Some(84));
        let dense3 = LinearParams::new([batch_size, 84], [10, 84]).with_bias(Some(10));
        let w = [
            init(6 * 25),
            init(16 * 6 * 25),
            init(128 * 256),
            init(84 * 128),
            init(10 * 84),
        ];
        let b = [vec![0.; 6], vec![0.; 16], vec![0.; 128], vec![0.; 84], vec![0.; 10]];
        let x = Array4::<f32>::from_shape_fn([batch_size, 1, 28, 28], |(n, _, h, w)| {
            ((n + h * w) % 255) as f32 / 255.
        });
        Self {
            batch_size,
            conv1,
            pool1,
            conv2,
            pool2,
            dense1,
            dense2,
            dense3,
            w,
            b,
            x: x.into_raw_vec(),
        }
    }
    /// Runs forward, then backward, returning the sum of the input gradient of the first dense layer.
    pub fn train(&self, factory: &LayerFactory) -> Result<f32> {
        let n = self.batch_size;
        let Self { w, b, .. } = self;
        let mut c1 = vec![0.; n * 6 * 24 * 24];
        Convolution2D::do_forward(
            factory,
            &self.conv1,
            &self.x,
            &w[0],
            Some(b[0].as_slice()),
            &mut c1,
        )?;
        let mut r1 = vec![0.; c1.len()];
        Relu4d::do_forward(factory, &[n, 6, 24, 24], &c1, &mut r1)?;
        let mut p1 = vec![0.; n * 6 * 12 * 12];
        MaxPool::do_forward(factory, &self.pool1, &r1, &mut p1)?;
        let mut c2 = vec![0.; n * 16 * 8 * 8];
        Convolution2D::do_forward(
            factory,
            &self.conv2,
            &p1,
            &w[1],
            Some(b[1].as_slice()),
            &mut c2,
        )?;
        let mut r2 = vec![0.; c2.len()];
        Relu4d::do_forward(factory, &[n, 16, 8, 8], &c2, &mut r2)?;
        let mut p2 = vec![0.; n * 256];
        MaxPool::do_forward(factory, &self.pool2, &r2, &mut p2)?;
        let mut d1 = vec![0.; n * 128];
        Linear::do_forward(factory, &self.dense1, &p2, &w[2], Some(b[2].as_slice()), &mut d1)?;
        let mut a1 = vec![0.; d1.len()];
        Relu::do_forward(factory, &[d1.len()], &d1, &mut a1)?;
        let mut d2 = vec![0.; n * 84];
        Linear::do_forward(factory, &self.dense2, &a1, &w[3], Some(b[3].as_slice()), &mut d2)?;
        let mut a2 = vec![0.; d2.len()];
        Relu::do_forward(factory, &[d2.len()], &d2, &mut a2)?;
        let mut d3 = vec![0.; n * 10];
        Linear::do_forward(factory, &self.dense3, &a2, &w[4], Some(b[4].as_slice()), &mut d3)?;
        let softmax = SoftmaxParams::new([n, 10]);
        let mut y = vec![0.; d3.len()];
        Softmax2D::do_forward(factory, &softmax, &d3, &mut y)?;

        let gy: Vec<f32> = (0..y.len()).map(|i| if i % 10 == 0 { -1. } else { 0. }).collect();
        let mut g3 = vec![0.; y.len()];
        Softmax2D::do_backward(factory, &softmax, &y, &gy, &mut g3)?;
        let mut gw = w.clone();
        let mut gb = b.clone();
        let mut g_a2 = vec![0.; a2.len()];
        let [_, _, gw2, gw3, gw4] = &mut gw;
        let [_, _, gb2, gb3, gb4] = &mut gb;
        Linear::do_backward(
            factory,
            &self.dense3,
            &a2,
            &w[4],
            &g3,
            gw4,
            Some(gb4.as_mut_slice()),
            &mut g_a2,
            false,
        )?;
        let mut g_d2 = vec![0.; d2.len()];
        Relu::do_backward(factory, &[d2.len()], &d2, &g_a2, &mut g_d2)?;
        let mut g_a1 = vec![0.; a1.len()];
        Linear::do_backward(
            factory,
            &self.dense2,
            &a1,
            &w[3],
            &g_d2,
            gw3,
            Some(gb3.as_mut_slice()),
            &mut g_a1,
            false,
        )?;
        let mut g_d1 = vec![0.; d1.len()];
        Relu::do_backward(factory, &[d1.len()], &d1, &g_a1, &mut g_d1)?;
        let mut g_p2 = vec![0.; p2.len()];
        Linear::do_backward(
            factory,
            &self.dense1,
            &p2,
            &w[2],
            &g_d1,
            gw2,
            Some(gb2.as_mut_slice()),
            &mut g_p2,
            false,
        )?;
        Ok(Array1::from(g_p2).sum())
    }
}
