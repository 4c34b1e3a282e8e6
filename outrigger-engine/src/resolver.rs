//! The name resolution interface the engine consumes.
//!
//! Resolution is asynchronous: the engine hands the resolver a name and a
//! callback, and the callback receives the endpoint together with a context
//! describing where the answer came from.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::transport::Transport;

/// Where a resolution answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolverSource {
    #[default]
    Unknown,
    /// A previously cached answer.
    Cache,
    /// A local database or host file.
    Database,
    /// The operating system's resolver.
    System,
    /// A name server queried directly.
    Server,
}

/// Context accompanying a resolution answer.
#[derive(Debug, Clone, Default)]
pub struct ResolverContext {
    /// The authority that produced the answer.
    pub authority: Option<String>,
    /// How long resolution took.
    pub latency: Duration,
    /// The name server consulted, if any.
    pub name_server: Option<Endpoint>,
    /// Classification of the answer's source.
    pub source: ResolverSource,
}

/// Options for one resolution request.
#[derive(Debug, Clone, Default)]
pub struct GetEndpointOptions {
    /// Port to combine with the resolved host when the name carries none.
    pub port: Option<u16>,
    /// Restrict answers to endpoints this transport can address.
    pub transport: Option<Transport>,
    /// Deadline for the resolution itself.
    pub deadline: Option<Instant>,
}

/// Callback receiving a resolution answer.
pub type GetEndpointCallback = Box<dyn FnOnce(Result<Endpoint>, ResolverContext) + Send>;

/// An asynchronous name-to-endpoint service.
pub trait Resolver: Send + Sync {
    /// Resolve `name`, delivering the answer through `callback`.
    ///
    /// A synchronous error means the callback will never be invoked;
    /// otherwise the callback is invoked exactly once.
    fn get_endpoint(
        &self,
        name: &str,
        options: GetEndpointOptions,
        callback: GetEndpointCallback,
    ) -> Result<()>;
}

/// A resolver answering from a fixed table.
///
/// Used by tests and by deployments with static peer maps. Unknown names
/// resolve with `Invalid` delivered through the callback.
#[derive(Default)]
pub struct MapResolver {
    entries: Mutex<HashMap<String, Endpoint>>,
}

impl MapResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `name` with `endpoint`, replacing any previous entry.
    pub fn insert(&self, name: impl Into<String>, endpoint: Endpoint) {
        self.entries.lock().insert(name.into(), endpoint);
    }

    /// Remove the entry for `name`.
    pub fn remove(&self, name: &str) {
        self.entries.lock().remove(name);
    }
}

impl Resolver for MapResolver {
    fn get_endpoint(
        &self,
        name: &str,
        options: GetEndpointOptions,
        callback: GetEndpointCallback,
    ) -> Result<()> {
        let started = Instant::now();
        let found = self.entries.lock().get(name).cloned();

        let context = ResolverContext {
            authority: Some("static".to_string()),
            latency: started.elapsed(),
            name_server: None,
            source: ResolverSource::Database,
        };

        match found {
            Some(endpoint) => {
                let endpoint = match options.port {
                    Some(port) => endpoint.with_port(port),
                    None => endpoint,
                };
                if let Some(transport) = options.transport {
                    if !transport.accepts(&endpoint) {
                        callback(Err(Error::Invalid), context);
                        return Ok(());
                    }
                }
                callback(Ok(endpoint), context);
            }
            None => callback(Err(Error::Invalid), context),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_map_resolver_answers() {
        let resolver = MapResolver::new();
        resolver.insert("echo", Endpoint::loopback_v4(49152));

        let (tx, rx) = mpsc::channel();
        resolver
            .get_endpoint(
                "echo",
                GetEndpointOptions::default(),
                Box::new(move |result, context| {
                    tx.send((result, context.source)).unwrap();
                }),
            )
            .unwrap();

        let (result, source) = rx.recv().unwrap();
        assert_eq!(result.unwrap(), Endpoint::loopback_v4(49152));
        assert_eq!(source, ResolverSource::Database);
    }

    #[test]
    fn test_map_resolver_unknown_name() {
        let resolver = MapResolver::new();
        let (tx, rx) = mpsc::channel();
        resolver
            .get_endpoint(
                "nonesuch",
                GetEndpointOptions::default(),
                Box::new(move |result, _| {
                    tx.send(result).unwrap();
                }),
            )
            .unwrap();
        assert_eq!(rx.recv().unwrap(), Err(Error::Invalid));
    }

    #[test]
    fn test_map_resolver_port_override() {
        let resolver = MapResolver::new();
        resolver.insert("echo", Endpoint::loopback_v4(0));

        let (tx, rx) = mpsc::channel();
        resolver
            .get_endpoint(
                "echo",
                GetEndpointOptions {
                    port: Some(5555),
                    ..Default::default()
                },
                Box::new(move |result, _| {
                    tx.send(result).unwrap();
                }),
            )
            .unwrap();
        assert_eq!(rx.recv().unwrap().unwrap().port(), Some(5555));
    }
}
