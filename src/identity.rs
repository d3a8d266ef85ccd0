use crate::peer::types::Participant;

/// Supplies who the local participant is. Only used to label calls.
pub trait IdentityProvider: Send + Sync {
    fn participant(&self) -> Participant;
}

/// Fixed identity, e.g. taken from a finished login.
#[derive(Debug, Clone)]
pub struct StaticIdentity(Participant);

impl StaticIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self(Participant {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        })
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.0.avatar_url = Some(url.into());
        self
    }
}

impl IdentityProvider for StaticIdentity {
    fn participant(&self) -> Participant {
        self.0.clone()
    }
}
