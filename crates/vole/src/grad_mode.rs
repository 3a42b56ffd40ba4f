// Gradient recording switch
//
// Recording is on by default and scoped per thread. `no_grad()` returns a
// guard that turns it off until the guard drops, restoring whatever state
// was active before, so guards nest.

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether operations on this thread currently record graph nodes.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Restores the previous recording state on drop.
#[must_use = "recording resumes as soon as the guard is dropped"]
pub struct NoGradGuard {
    prev: bool,
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|g| g.set(self.prev));
    }
}

/// Stop recording graph nodes on this thread while the guard lives.
///
/// ```ignore
/// let _guard = vole::no_grad();
/// let y = x.mul(&w)?; // y has no autograd context
/// ```
pub fn no_grad() -> NoGradGuard {
    let prev = GRAD_ENABLED.with(|g| g.replace(false));
    NoGradGuard { prev }
}
