use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::mux::MuxTransport;
use crate::transport::restarting::RestartingTransport;
use crate::transport::stdio::StdioTransport;
use crate::transport::tcp::TcpStreamTransport;
use crate::transport::tcp_server::TcpServerTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::Transport;

/// Creates a transport from its full expression (including the shorthand). The registry is
///  passed along so that composite transports can create their children.
pub type TransportFactory = fn(&TransportRegistry, &str) -> anyhow::Result<Arc<dyn Transport>>;

/// Maps the shorthand before the first `:` of a transport expression to a factory, e.g.
///  `tcp` for `tcp:localhost:8888`.
pub struct TransportRegistry {
    factories: FxHashMap<String, TransportFactory>,
}

impl Default for TransportRegistry {
    /// A registry with all built-in transports
    fn default() -> Self {
        let mut registry = TransportRegistry::empty();
        registry.register("udp", UdpTransport::from_expression);
        registry.register("tcp", TcpStreamTransport::from_expression);
        registry.register("tcpserv", TcpServerTransport::from_expression);
        registry.register("mux", MuxTransport::from_expression);
        registry.register("restart", RestartingTransport::from_expression);
        registry.register("stdio", StdioTransport::from_expression);
        registry
    }
}

impl TransportRegistry {
    pub fn empty() -> TransportRegistry {
        TransportRegistry {
            factories: FxHashMap::default(),
        }
    }

    /// Registers a factory for `shorthand`, replacing any previous registration
    pub fn register(&mut self, shorthand: &str, factory: TransportFactory) {
        if self.factories.insert(shorthand.to_string(), factory).is_some() {
            debug!("replaced transport factory for '{}'", shorthand);
        }
    }

    pub fn shorthands(&self) -> Vec<&str> {
        let mut result: Vec<&str> = self.factories.keys()
            .map(|s| s.as_str())
            .collect();
        result.sort();
        result
    }

    pub fn create(&self, expression: &str) -> anyhow::Result<Arc<dyn Transport>> {
        let shorthand = expression.split_once(':')
            .map(|(shorthand, _)| shorthand)
            .unwrap_or(expression);

        let factory = self.factories.get(shorthand)
            .ok_or_else(|| TransportError::UnknownShorthand(shorthand.to_string()))?;
        factory(self, expression)
    }
}

/// Creates a transport from an expression using the built-in transports, e.g.
///  `restart:5:tcp:localhost:8888` or `mux:(udp:8888)(tcpserv::8889)`.
pub fn transport_from_str(expression: &str) -> anyhow::Result<Arc<dyn Transport>> {
    static DEFAULT_REGISTRY: OnceLock<TransportRegistry> = OnceLock::new();
    DEFAULT_REGISTRY.get_or_init(TransportRegistry::default)
        .create(expression)
}
