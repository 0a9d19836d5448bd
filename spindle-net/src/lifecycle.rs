/// Lifetime hooks for objects owned by a host application.
///
/// The host calls `acquire` when it starts holding on to the object and
/// `release` when it lets go. Objects use these hooks to set up and tear
/// down resources without ever driving the host's own loop.
pub trait Lifecycle {
    fn acquire(&mut self);
    fn release(&mut self);
}
