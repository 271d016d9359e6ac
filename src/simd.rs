use std::ops::{Add, AddAssign, Div, Index, IndexMut, Mul, Sub};

/// Lane count used by the slice kernels below.
pub const LANES: usize = 8;

/// A fixed-width bundle of floats. Plain arrays with elementwise loops are
/// what LLVM turns into packed instructions for whatever width the target
/// has, so there are no intrinsics or register casts here.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C, align(32))]
pub struct SimdF32<const N: usize> {
    data: [f32; N],
}

pub type F32x8 = SimdF32<LANES>;

impl<const N: usize> SimdF32<N> {
    pub fn zeroed() -> Self {
        Self { data: [0.; N] }
    }

    pub fn splat(x: f32) -> Self {
        Self { data: [x; N] }
    }

    /// Reads the first `N` values of `src`.
    #[inline(always)]
    pub fn load(src: &[f32]) -> Self {
        let mut data = [0.; N];
        data.copy_from_slice(&src[..N]);
        Self { data }
    }

    #[inline(always)]
    pub fn store(self, dst: &mut [f32]) {
        dst[..N].copy_from_slice(&self.data);
    }

    #[inline(always)]
    fn map(self, f: impl Fn(f32) -> f32) -> Self {
        let mut data = self.data;
        data.iter_mut().for_each(|x| *x = f(*x));
        Self { data }
    }

    #[inline(always)]
    fn zip(self, rhs: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        let mut data = self.data;
        data.iter_mut().zip(rhs.data).for_each(|(a, b)| *a = f(*a, b));
        Self { data }
    }

    pub fn sqrt(self) -> Self {
        self.map(f32::sqrt)
    }

    pub fn max(self, rhs: Self) -> Self {
        self.zip(rhs, f32::max)
    }

    pub fn min(self, rhs: Self) -> Self {
        self.zip(rhs, f32::min)
    }

    /// `self * a + b`
    pub fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }

    /// 1.0 in every lane where `self > threshold`, else 0.0.
    pub fn gt_mask(self, threshold: f32) -> Self {
        self.map(|x| if x > threshold { 1. } else { 0. })
    }

    pub fn reduce_sum(self) -> f32 {
        self.data.iter().sum()
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    pub fn any_zero(&self) -> bool {
        self.data.iter().any(|&x| x == 0.)
    }
}

impl<const N: usize> Add for SimdF32<N> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a + b)
    }
}

impl<const N: usize> AddAssign for SimdF32<N> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<const N: usize> Sub for SimdF32<N> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a - b)
    }
}

impl<const N: usize> Mul for SimdF32<N> {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a * b)
    }
}

impl<const N: usize> Div for SimdF32<N> {
    type Output = Self;

    fn div(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a / b)
    }
}

impl<const N: usize> Index<usize> for SimdF32<N> {
    type Output = f32;

    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

impl<const N: usize> IndexMut<usize> for SimdF32<N> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl<const N: usize> From<[f32; N]> for SimdF32<N> {
    fn from(value: [f32; N]) -> Self {
        Self { data: value }
    }
}

/// `dst += src`
pub fn add_assign(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    let split = dst.len() - dst.len() % LANES;
    let (dst_body, dst_tail) = dst.split_at_mut(split);
    let (src_body, src_tail) = src.split_at(split);

    for (d, s) in dst_body.chunks_exact_mut(LANES).zip(src_body.chunks_exact(LANES)) {
        (F32x8::load(d) + F32x8::load(s)).store(d);
    }
    dst_tail.iter_mut().zip(src_tail).for_each(|(d, &s)| *d += s);
}

/// `dst += src * scale`
pub fn add_scaled(dst: &mut [f32], src: &[f32], scale: f32) {
    debug_assert_eq!(dst.len(), src.len());
    let split = dst.len() - dst.len() % LANES;
    let (dst_body, dst_tail) = dst.split_at_mut(split);
    let (src_body, src_tail) = src.split_at(split);
    let s8 = F32x8::splat(scale);

    for (d, s) in dst_body.chunks_exact_mut(LANES).zip(src_body.chunks_exact(LANES)) {
        F32x8::load(s).mul_add(s8, F32x8::load(d)).store(d);
    }
    dst_tail.iter_mut().zip(src_tail).for_each(|(d, &s)| *d += s * scale);
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let split = a.len() - a.len() % LANES;
    let mut acc = F32x8::zeroed();
    for (x, y) in a[..split].chunks_exact(LANES).zip(b[..split].chunks_exact(LANES)) {
        acc = F32x8::load(x).mul_add(F32x8::load(y), acc);
    }
    acc.reduce_sum() + a[split..].iter().zip(&b[split..]).map(|(x, y)| x * y).sum::<f32>()
}

/// Clamps every value into `[0, max]`. Pass `f32::INFINITY` for a plain ReLU.
pub fn clamp_relu(values: &mut [f32], max: f32) {
    let split = values.len() - values.len() % LANES;
    let (body, tail) = values.split_at_mut(split);
    let lo = F32x8::zeroed();
    let hi = F32x8::splat(max);
    for chunk in body.chunks_exact_mut(LANES) {
        F32x8::load(chunk).max(lo).min(hi).store(chunk);
    }
    tail.iter_mut().for_each(|x| *x = x.clamp(0., max));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, k: f32) -> Vec<f32> {
        (0..n).map(|i| (i as f32 - n as f32 / 2.) * k).collect()
    }

    #[test]
    fn kernels_handle_tails() {
        for n in [0, 1, 7, 8, 9, 17, 32] {
            let a = ramp(n, 0.5);
            let b = ramp(n, -0.25);

            let expected: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
            assert!((dot(&a, &b) - expected).abs() < 1e-3);

            let mut sum = a.clone();
            add_assign(&mut sum, &b);
            assert!(sum.iter().zip(a.iter().zip(&b)).all(|(s, (x, y))| *s == x + y));

            let mut scaled = a.clone();
            add_scaled(&mut scaled, &b, 2.);
            assert!(scaled.iter().zip(a.iter().zip(&b)).all(|(s, (x, y))| (*s - (x + 2. * y)).abs() < 1e-6));
        }
    }

    #[test]
    fn clipped_relu_saturates() {
        let mut v = vec![-2., -0.5, 0., 0.25, 0.99, 1., 3., 100., -1., 0.5];
        clamp_relu(&mut v, 1.);
        assert_eq!(v, vec![0., 0., 0., 0.25, 0.99, 1., 1., 1., 0., 0.5]);

        let mut w = vec![-1., 5.];
        clamp_relu(&mut w, f32::INFINITY);
        assert_eq!(w, vec![0., 5.]);
    }

    #[test]
    fn lane_ops() {
        let a = F32x8::from([1., 4., 9., 16., 0., -1., 2., 3.]);
        assert_eq!(a.sqrt()[3], 4.);
        assert_eq!(a.gt_mask(0.)[4], 0.);
        assert_eq!(a.gt_mask(0.)[6], 1.);
        assert!(a.any_zero());
        assert!(!(a / F32x8::zeroed()).all_finite());
    }
}
