//! Table of live endpoints, keyed by handle and by identity.

use std::collections::BTreeMap;

use chrono::Utc;

use super::endpoint::{Endpoint, Handle, SessionId};
use crate::wire::EndpointName;

pub const DEFAULT_MAX_CLIENTS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handle {0} is already occupied by a live endpoint")]
    DuplicateHandle(Handle),
    #[error("endpoint {0} is already connected")]
    DuplicateIdentity(EndpointName),
    #[error("registry is full ({capacity} clients)")]
    RegistryFull { capacity: usize },
    #[error("no endpoint registered under handle {0}")]
    UnknownHandle(Handle),
}

/// Slot 0 always holds the builtin endpoint; client handles index the
/// remaining slots directly. The identity index only holds live endpoints that
/// finished authentication.
#[derive(Debug)]
pub struct EndpointRegistry {
    slots: Vec<Option<Endpoint>>,
    names: BTreeMap<EndpointName, Handle>,
    nr_clients: usize,
    capacity: usize,
    next_session: u64,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS)
    }
}

impl EndpointRegistry {
    pub fn new(max_clients: usize) -> Self {
        let mut slots: Vec<Option<Endpoint>> = (0..=max_clients).map(|_| None).collect();
        let builtin = Endpoint::builtin(Utc::now());
        let mut names = BTreeMap::new();
        names.insert(EndpointName::builtin(), Handle::BUILTIN);
        slots[Handle::BUILTIN.index()] = Some(builtin);

        Self {
            slots,
            names,
            nr_clients: 0,
            capacity: max_clients,
            next_session: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of client endpoints (the builtin endpoint is not counted).
    pub fn len(&self) -> usize {
        self.nr_clients
    }

    pub fn is_empty(&self) -> bool {
        self.nr_clients == 0
    }

    /// Checks whether `admit(handle, ..)` would succeed.
    pub fn can_admit(&self, handle: Handle) -> Result<(), RegistryError> {
        let full = RegistryError::RegistryFull {
            capacity: self.capacity,
        };
        if handle == Handle::BUILTIN {
            return Err(RegistryError::DuplicateHandle(handle));
        }
        match self.slots.get(handle.index()) {
            None => Err(full),
            Some(Some(_)) => Err(RegistryError::DuplicateHandle(handle)),
            Some(None) if self.nr_clients >= self.capacity => Err(full),
            Some(None) => Ok(()),
        }
    }

    /// Inserts a freshly accepted endpoint and assigns it a new session.
    pub fn admit(&mut self, handle: Handle, mut endpoint: Endpoint) -> Result<SessionId, RegistryError> {
        self.can_admit(handle)?;

        self.next_session += 1;
        let session = SessionId::new(self.next_session);
        endpoint.attach(handle, session);
        self.slots[handle.index()] = Some(endpoint);
        self.nr_clients += 1;
        tracing::trace!(%handle, %session, nr_clients = self.nr_clients, "Endpoint admitted");
        Ok(session)
    }

    /// Records the authenticated identity of the endpoint at `handle`.
    pub fn bind_identity(&mut self, handle: Handle, name: EndpointName) -> Result<(), RegistryError> {
        if self.lookup_by_handle(handle).is_none() {
            return Err(RegistryError::UnknownHandle(handle));
        }
        if let Some(&owner) = self.names.get(&name)
            && owner != handle
        {
            return Err(RegistryError::DuplicateIdentity(name));
        }

        let endpoint = self
            .lookup_by_handle_mut(handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        if let Some(previous) = endpoint.set_name(name.clone())
            && previous != name
        {
            self.names.remove(&previous);
        }
        self.names.insert(name, handle);
        Ok(())
    }

    pub fn lookup_by_handle(&self, handle: Handle) -> Option<&Endpoint> {
        self.slots.get(handle.index())?.as_ref()
    }

    pub fn lookup_by_handle_mut(&mut self, handle: Handle) -> Option<&mut Endpoint> {
        self.slots.get_mut(handle.index())?.as_mut()
    }

    pub fn handle_of(&self, name: &EndpointName) -> Option<Handle> {
        self.names.get(name).copied()
    }

    pub fn lookup_by_identity(&self, name: &EndpointName) -> Option<&Endpoint> {
        self.lookup_by_handle(self.handle_of(name)?)
    }

    pub fn lookup_by_identity_mut(&mut self, name: &EndpointName) -> Option<&mut Endpoint> {
        let handle = self.handle_of(name)?;
        self.lookup_by_handle_mut(handle)
    }

    /// Removes the endpoint at `handle`. Evicting an empty slot is a no-op;
    /// the builtin endpoint cannot be evicted.
    pub fn evict(&mut self, handle: Handle) -> Option<Endpoint> {
        if handle == Handle::BUILTIN {
            tracing::warn!("Refusing to evict the builtin endpoint");
            return None;
        }
        let endpoint = self.slots.get_mut(handle.index())?.take()?;
        if let Some(name) = endpoint.name()
            && self.names.get(name) == Some(&handle)
        {
            self.names.remove(name);
        }
        self.nr_clients -= 1;
        tracing::trace!(%handle, nr_clients = self.nr_clients, "Endpoint removed from registry");
        Some(endpoint)
    }

    /// Authenticated endpoints in identity order, builtin included.
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.names
            .values()
            .filter_map(move |&handle| self.lookup_by_handle(handle))
    }

    /// Handles of every client endpoint, authenticated or not.
    pub fn client_handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(index, slot)| slot.as_ref().map(|_| Handle::new(index as u32)))
            .collect()
    }

    /// Routable endpoints subscribed to `bubble`, in identity order.
    pub fn handles_subscribed_to(&self, bubble: &str) -> Vec<Handle> {
        self.iter()
            .filter(|e| e.is_routable() && e.has_bubble(bubble))
            .map(Endpoint::handle)
            .collect()
    }
}
