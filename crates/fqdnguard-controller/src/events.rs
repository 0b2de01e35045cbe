//! Watch events as Created/Updated/Deleted
//!
//! The kube watcher only reports "this object now looks like X" (`Apply`) and
//! "this object is gone" (`Delete`), plus relist markers. [`EventTranslator`]
//! remembers the last body seen per object so updates carry both sides.

use std::collections::HashMap;

use kube::runtime::watcher;

use fqdnguard_common::cache::ResourceIdentity;
use fqdnguard_common::crd::HTTPProxy;

/// Change to one HTTPProxy
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyEvent {
    /// First sighting of an object
    Created(HTTPProxy),
    /// A known object changed
    Updated {
        /// Body before the change
        old: HTTPProxy,
        /// Body after the change
        new: HTTPProxy,
    },
    /// Object removed from the cluster
    Deleted(HTTPProxy),
}

impl ProxyEvent {
    /// Object the event is about (the new body for updates)
    pub fn object(&self) -> &HTTPProxy {
        match self {
            Self::Created(p) | Self::Deleted(p) => p,
            Self::Updated { new, .. } => new,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Turns watcher events into [`ProxyEvent`]s
#[derive(Debug, Default)]
pub struct EventTranslator {
    known: HashMap<ResourceIdentity, HTTPProxy>,
    relist: Option<HashMap<ResourceIdentity, HTTPProxy>>,
}

impl EventTranslator {
    /// Translator that already knows `proxies`, e.g. the bootstrap listing.
    ///
    /// The watcher's initial listing is then diffed against them instead of
    /// reporting every object as created.
    pub fn seeded(proxies: impl IntoIterator<Item = HTTPProxy>) -> Self {
        Self {
            known: proxies.into_iter().map(|p| (p.identity(), p)).collect(),
            relist: None,
        }
    }

    /// Number of objects currently known
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// True if no object is known
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Events implied by one watcher event, in the order to apply them
    pub fn translate(&mut self, event: watcher::Event<HTTPProxy>) -> Vec<ProxyEvent> {
        match event {
            watcher::Event::Apply(proxy) => self.apply(proxy).into_iter().collect(),
            watcher::Event::Delete(proxy) => {
                let last = self.known.remove(&proxy.identity());
                vec![ProxyEvent::Deleted(last.unwrap_or(proxy))]
            }
            watcher::Event::Init => {
                self.relist = Some(HashMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(proxy) => {
                self.relist
                    .get_or_insert_with(HashMap::new)
                    .insert(proxy.identity(), proxy);
                Vec::new()
            }
            watcher::Event::InitDone => self.finish_relist(),
        }
    }

    fn apply(&mut self, proxy: HTTPProxy) -> Option<ProxyEvent> {
        match self.known.insert(proxy.identity(), proxy.clone()) {
            None => Some(ProxyEvent::Created(proxy)),
            Some(old) if old == proxy => None,
            Some(old) => Some(ProxyEvent::Updated { old, new: proxy }),
        }
    }

    fn finish_relist(&mut self) -> Vec<ProxyEvent> {
        let fresh = self.relist.take().unwrap_or_default();
        let mut events = Vec::new();

        // Deletions first so keys freed during the gap can be confirmed again
        let mut gone: Vec<_> = self
            .known
            .iter()
            .filter(|(id, _)| !fresh.contains_key(*id))
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        events.extend(gone.into_iter().map(|(_, p)| ProxyEvent::Deleted(p)));

        let mut current: Vec<_> = fresh.iter().collect();
        current.sort_by(|a, b| a.0.cmp(b.0));
        for (id, proxy) in current {
            match self.known.get(id) {
                None => events.push(ProxyEvent::Created(proxy.clone())),
                Some(old) if old != proxy => events.push(ProxyEvent::Updated {
                    old: old.clone(),
                    new: proxy.clone(),
                }),
                Some(_) => {}
            }
        }

        self.known = fresh;
        events
    }
}
