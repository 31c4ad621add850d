//! Explicit registration of the roles a rendering system plays, looked up by tag rather
//! than probed at run time.

/// The closed set of roles a producer can register for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    ShadowProvider,
    AoProvider,
    PhysicsProvider,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::ShadowProvider,
        Capability::AoProvider,
        Capability::PhysicsProvider,
    ];

    fn index(self) -> usize {
        match self {
            Capability::ShadowProvider => 0,
            Capability::AoProvider => 1,
            Capability::PhysicsProvider => 2,
        }
    }
}

/// Producers registered per capability, in registration order.
pub struct CapabilityTable<T> {
    providers: [Vec<T>; 3],
}

impl<T> Default for CapabilityTable<T> {
    fn default() -> Self {
        Self {
            providers: [Vec::new(), Vec::new(), Vec::new()],
        }
    }
}

impl<T> CapabilityTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Capability, provider: T) {
        self.providers[capability.index()].push(provider);
    }

    pub fn providers(&self, capability: Capability) -> &[T] {
        &self.providers[capability.index()]
    }

    pub fn providers_mut(&mut self, capability: Capability) -> &mut [T] {
        &mut self.providers[capability.index()]
    }

    pub fn has(&self, capability: Capability) -> bool {
        !self.providers[capability.index()].is_empty()
    }

    /// Drops every registration matching `f`, for any capability.
    pub fn unregister(&mut self, mut f: impl FnMut(&T) -> bool) {
        for providers in self.providers.iter_mut() {
            providers.retain(|provider| !f(provider));
        }
    }
}

impl<T: PartialEq> CapabilityTable<T> {
    /// Capabilities `provider` is registered for.
    pub fn capabilities_of<'a>(&'a self, provider: &'a T) -> impl Iterator<Item = Capability> + 'a {
        Capability::ALL
            .into_iter()
            .filter(move |capability| self.providers(*capability).contains(provider))
    }
}
