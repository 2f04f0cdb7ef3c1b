//! Port resolution for the pause container
//!
//! Application containers share the pause container's network namespace, so
//! every port declared anywhere in the task definition is published on the
//! pause container. Operator overrides replace the host port for a given
//! container port.

use crate::errors::ConfigError;
use crate::task::TaskDescriptor;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Operator-supplied `containerPort:hostPort` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortOverride {
    pub container: u16,
    pub host: u16,
}

impl PortOverride {
    /// Parse a `containerPort:hostPort` value
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPortOverride {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (container, host) = value
            .split_once(':')
            .ok_or_else(|| invalid("expected containerPort:hostPort"))?;
        let container = parse_port(container).ok_or_else(|| invalid("invalid container port"))?;
        let host = parse_port(host).ok_or_else(|| invalid("invalid host port"))?;

        Ok(Self { container, host })
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

impl FromStr for PortOverride {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PortOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.host)
    }
}

/// Resolved table of container port to host port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBindings {
    bindings: BTreeMap<u16, u16>,
}

impl PortBindings {
    /// Collect mappings from every container in the descriptor, then apply overrides.
    ///
    /// A mapping without a host port publishes the container port on the same
    /// host port.
    pub fn resolve(descriptor: &TaskDescriptor, overrides: &[PortOverride]) -> Self {
        let mut bindings = BTreeMap::new();
        for container in descriptor.containers() {
            for mapping in &container.port_mappings {
                let Some(container_port) = mapping.container_port.or(mapping.host_port) else {
                    continue;
                };
                let host_port = mapping.host_port.unwrap_or(container_port);
                bindings.insert(container_port, host_port);
            }
        }

        for port in overrides {
            if let Some(previous) = bindings.insert(port.container, port.host) {
                debug!("Port override {} replaces host port {}", port, previous);
            }
        }

        Self { bindings }
    }

    /// Host port published for a container port
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.bindings.get(&container_port).copied()
    }

    /// `(container, host)` pairs ordered by container port
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.bindings.iter().map(|(c, h)| (*c, *h))
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ContainerSpec, PortMapping};

    fn descriptor(mappings: Vec<PortMapping>) -> TaskDescriptor {
        TaskDescriptor::new(vec![ContainerSpec {
            name: "web".to_string(),
            image: "nginx".to_string(),
            port_mappings: mappings,
            ..Default::default()
        }])
    }

    #[test]
    fn test_parse_port_override() {
        let port = PortOverride::parse("80:9090").unwrap();
        assert_eq!(port.container, 80);
        assert_eq!(port.host, 9090);
        assert_eq!(port.to_string(), "80:9090");
    }

    #[test]
    fn test_parse_port_override_rejects_malformed() {
        assert!(PortOverride::parse("80").is_err());
        assert!(PortOverride::parse("80:").is_err());
        assert!(PortOverride::parse("http:80").is_err());
        assert!(PortOverride::parse("0:80").is_err());
        assert!(PortOverride::parse("80:70000").is_err());
    }

    #[test]
    fn test_override_wins_over_descriptor() {
        let task = descriptor(vec![PortMapping {
            container_port: Some(80),
            host_port: Some(8080),
        }]);
        let ports = PortBindings::resolve(&task, &[PortOverride::parse("80:9090").unwrap()]);
        assert_eq!(ports.host_port(80), Some(9090));
        assert_eq!(ports.len(), 1);
    }

    #[test]
    fn test_missing_ports_fall_back_to_each_other() {
        let task = descriptor(vec![
            PortMapping {
                container_port: Some(3000),
                host_port: None,
            },
            PortMapping {
                container_port: None,
                host_port: Some(5432),
            },
            PortMapping {
                container_port: None,
                host_port: None,
            },
        ]);
        let ports = PortBindings::resolve(&task, &[]);
        assert_eq!(
            ports.iter().collect::<Vec<_>>(),
            vec![(3000, 3000), (5432, 5432)]
        );
    }

    #[test]
    fn test_override_adds_new_binding() {
        let task = descriptor(vec![]);
        let ports = PortBindings::resolve(&task, &[PortOverride::parse("8443:443").unwrap()]);
        assert_eq!(ports.host_port(8443), Some(443));
    }
}
