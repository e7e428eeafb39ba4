/// Runs the wrapped closure when dropped, including on early return and when
/// an enclosing future is cancelled.
pub struct Defer<F: FnOnce()>(pub Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

macro_rules! defer {
    ($func:block) => {
        let _defer = $crate::defer::Defer(Some(|| $func));
    };
    ($func:expr) => {
        let _defer = $crate::defer::Defer(Some($func));
    };
}
