//! Declarative topology: endpoints, shaped links and the interfaces they
//! imply.
//!
//! Building a [`Topology`] is pure data construction. Nothing here touches
//! the host; see [`crate::session`] for instantiation.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigurationError;

/// Linux `IFNAMSIZ` minus the trailing NUL.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Endpoints are numbered into `10.0.0.0/8` from `.1`; the last octet caps
/// how many can be addressed.
pub const MAX_ENDPOINTS: usize = 254;

/// Name of the `index`-th interface of `endpoint`.
pub fn interface_name(endpoint: &str, index: usize) -> String {
    format!("{endpoint}-eth{index}")
}

/// Link-layer shaping applied to both ends of a link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkShaping {
    pub rate_kbit: u64,
    pub delay: Duration,
    pub jitter: Option<Duration>,
    pub loss_percent: Option<f32>,
    /// Explicit netem queue limit in packets. Derived from the
    /// bandwidth-delay product when unset.
    pub queue_limit: Option<u32>,
}

impl LinkShaping {
    pub fn new(bandwidth_mbit: u64, delay: Duration) -> Self {
        Self {
            rate_kbit: bandwidth_mbit.saturating_mul(1000),
            delay,
            jitter: None,
            loss_percent: None,
            queue_limit: None,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn with_loss(mut self, percent: f32) -> Self {
        self.loss_percent = Some(percent);
        self
    }

    pub fn with_queue_limit(mut self, packets: u32) -> Self {
        self.queue_limit = Some(packets);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interface {
    pub endpoint: String,
    pub index: usize,
    pub name: String,
    /// Index of the link this interface terminates.
    pub link: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub name: String,
    /// 1-based declaration order.
    pub ordinal: usize,
    pub interfaces: Vec<Interface>,
}

impl Endpoint {
    /// Default host address, `10.0.0.<ordinal>`.
    pub fn default_address(&self) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, self.ordinal as u8)
    }

    pub fn interface(&self, index: usize) -> Option<&Interface> {
        self.interfaces.get(index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub index: usize,
    pub a: String,
    pub b: String,
    pub a_interface: String,
    pub b_interface: String,
    pub shaping: LinkShaping,
}

/// A validated set of endpoints and links.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Topology {
    endpoints: Vec<Endpoint>,
    links: Vec<Link>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn interface(&self, endpoint: &str, index: usize) -> Option<&Interface> {
        self.endpoint(endpoint).and_then(|e| e.interface(index))
    }

    pub fn endpoint_names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|e| e.name.as_str())
    }
}

/// Collects endpoint and link declarations; validation happens in
/// [`TopologyBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    endpoints: Vec<String>,
    links: Vec<(String, String, LinkShaping)>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, name: impl Into<String>) -> Self {
        self.endpoints.push(name.into());
        self
    }

    pub fn link(mut self, a: impl Into<String>, b: impl Into<String>, shaping: LinkShaping) -> Self {
        self.links.push((a.into(), b.into(), shaping));
        self
    }

    pub fn build(self) -> Result<Topology, ConfigurationError> {
        if self.endpoints.len() > MAX_ENDPOINTS {
            return Err(ConfigurationError::TooManyEndpoints {
                count: self.endpoints.len(),
                max: MAX_ENDPOINTS,
            });
        }

        let mut seen = HashSet::new();
        for name in &self.endpoints {
            validate_endpoint_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(ConfigurationError::DuplicateEndpoint { name: name.clone() });
            }
        }

        let mut endpoints: Vec<Endpoint> = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, name)| Endpoint {
                name: name.clone(),
                ordinal: idx + 1,
                interfaces: Vec::new(),
            })
            .collect();
        let position: HashMap<String, usize> = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let mut links = Vec::with_capacity(self.links.len());
        for (link_idx, (a, b, shaping)) in self.links.into_iter().enumerate() {
            let a_pos = *position
                .get(&a)
                .ok_or_else(|| ConfigurationError::UndeclaredEndpoint {
                    link: link_idx,
                    endpoint: a.clone(),
                })?;
            let b_pos = *position
                .get(&b)
                .ok_or_else(|| ConfigurationError::UndeclaredEndpoint {
                    link: link_idx,
                    endpoint: b.clone(),
                })?;
            if a_pos == b_pos {
                return Err(ConfigurationError::SelfLink {
                    link: link_idx,
                    endpoint: a,
                });
            }
            if shaping.rate_kbit == 0 {
                return Err(ConfigurationError::ZeroBandwidth { link: link_idx });
            }

            let a_interface = attach(&mut endpoints[a_pos], link_idx)?;
            let b_interface = attach(&mut endpoints[b_pos], link_idx)?;
            links.push(Link {
                index: link_idx,
                a,
                b,
                a_interface,
                b_interface,
                shaping,
            });
        }

        Ok(Topology { endpoints, links })
    }
}

/// Appends the next interface to `endpoint` and returns its name.
fn attach(endpoint: &mut Endpoint, link: usize) -> Result<String, ConfigurationError> {
    let index = endpoint.interfaces.len();
    let name = interface_name(&endpoint.name, index);
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(ConfigurationError::InterfaceNameTooLong {
            name,
            max: MAX_INTERFACE_NAME_LEN,
        });
    }
    endpoint.interfaces.push(Interface {
        endpoint: endpoint.name.clone(),
        index,
        name: name.clone(),
        link,
    });
    Ok(name)
}

fn validate_endpoint_name(name: &str) -> Result<(), ConfigurationError> {
    if name.is_empty() {
        return Err(ConfigurationError::EmptyEndpointName);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigurationError::InvalidEndpointName {
            name: name.to_string(),
        });
    }
    Ok(())
}
