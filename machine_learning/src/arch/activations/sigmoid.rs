/// Logistic function, evaluated without overflowing `exp` for large `|z|`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sigmoid;

impl Sigmoid {
    pub fn f(&self, z: f32) -> f32 {
        if z >= 0. {
            1. / (1. + (-z).exp())
        } else {
            let e = z.exp();
            e / (1. + e)
        }
    }

    pub fn df(&self, z: f32) -> f32 {
        let s = self.f(z);
        s * (1. - s)
    }
}
