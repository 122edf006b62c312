/// RAII guard for a registered subscriber.
///
/// Dropping the guard (or calling [`Subscription::unsubscribe`]) removes the
/// callback and releases its hold on the scope.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Remove the subscriber now.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    /// Keep the subscriber registered for the lifetime of its store.
    pub fn detach(mut self) {
        self.release.take();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
