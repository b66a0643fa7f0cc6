//! Envoy static configuration for the ingress proxy: one TCP-proxy listener
//! per exposed service port, each forwarding to the pod's network alias on
//! the session network.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EnvoyConfig {
    #[serde(skip)]
    ports: HashMap<u16, u16>,
    pub static_resources: StaticResources,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StaticResources {
    pub listeners: Vec<Listener>,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    pub address: Address,
    pub filter_chains: Vec<FilterChain>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FilterChain {
    pub filters: Vec<Filter>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub typed_config: TypedConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TypedConfig {
    #[serde(rename = "@type")]
    pub type_url: String,
    pub stat_prefix: String,
    pub cluster: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Address {
    pub socket_address: SocketAddress,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SocketAddress {
    pub address: String,
    pub port_value: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub connect_timeout: String,
    #[serde(rename = "type")]
    pub cluster_type: String,
    pub dns_lookup_family: String,
    pub load_assignment: LoadAssignment,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LoadAssignmentEndpoint>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadAssignmentEndpoint {
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LbEndpoint {
    pub endpoint: Endpoint,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: Address,
}

impl EnvoyConfig {
    pub fn new() -> Self {
        EnvoyConfig::default()
    }

    /// Expose `pod_name:port` on `expose_port` of the proxy.
    pub fn add_expose_port(
        &mut self,
        pod_name: &str,
        port: u16,
        expose_port: u16,
    ) -> Result<()> {
        if self.ports.insert(expose_port, port).is_some() {
            return Err(Error::Validation(format!(
                "port:{expose_port} is duplicate"
            )));
        }
        let cluster_name = format!("cluster_{pod_name}_{port}");
        self.static_resources.listeners.push(Listener {
            name: format!("listener_{pod_name}_{port}"),
            address: Address {
                socket_address: SocketAddress {
                    address: "0.0.0.0".to_string(),
                    port_value: expose_port,
                },
            },
            filter_chains: vec![FilterChain {
                filters: vec![Filter {
                    name: "envoy.filters.network.tcp_proxy".to_string(),
                    typed_config: TypedConfig {
                        type_url:
                            "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy"
                                .to_string(),
                        stat_prefix: "destination".to_string(),
                        cluster: cluster_name.clone(),
                    },
                }],
            }],
        });
        self.static_resources.clusters.push(Cluster {
            name: cluster_name.clone(),
            connect_timeout: "30s".to_string(),
            cluster_type: "LOGICAL_DNS".to_string(),
            dns_lookup_family: "V4_ONLY".to_string(),
            load_assignment: LoadAssignment {
                cluster_name,
                endpoints: vec![LoadAssignmentEndpoint {
                    lb_endpoints: vec![LbEndpoint {
                        endpoint: Endpoint {
                            address: Address {
                                socket_address: SocketAddress {
                                    address: pod_name.to_string(),
                                    port_value: port,
                                },
                            },
                        },
                    }],
                }],
            },
        });
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Parse the `{svc: "src:dst"}` body of `/ingress` into `(service, src, dst)`
/// triples.
pub fn parse_port_mappings(mappings: &HashMap<String, String>) -> Result<Vec<(String, u16, u16)>> {
    let mut parsed = Vec::new();
    for (service, mapping) in mappings {
        let (src, dst) = mapping.split_once(':').ok_or_else(|| {
            Error::Validation(format!(
                "invalid port mapping {mapping:?} for service {service}, want src:dst"
            ))
        })?;
        let src = src
            .parse()
            .map_err(|_| Error::Validation(format!("invalid source port {src:?}")))?;
        let dst = dst
            .parse()
            .map_err(|_| Error::Validation(format!("invalid target port {dst:?}")))?;
        parsed.push((service.clone(), src, dst));
    }
    parsed.sort();
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_and_cluster_are_paired_per_mapping() {
        let mut config = EnvoyConfig::new();
        config.add_expose_port("web", 80, 8080).unwrap();
        config.add_expose_port("db", 5432, 15432).unwrap();
        assert_eq!(config.static_resources.listeners.len(), 2);
        assert_eq!(config.static_resources.clusters.len(), 2);
        assert_eq!(
            config.static_resources.listeners[0].filter_chains[0].filters[0]
                .typed_config
                .cluster,
            "cluster_web_80"
        );
        assert_eq!(
            config.static_resources.clusters[0]
                .load_assignment
                .endpoints[0]
                .lb_endpoints[0]
                .endpoint
                .address
                .socket_address
                .address,
            "web"
        );
    }

    #[test]
    fn duplicate_expose_port_is_rejected() {
        let mut config = EnvoyConfig::new();
        config.add_expose_port("web", 80, 8080).unwrap();
        let err = config.add_expose_port("db", 5432, 8080).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn yaml_uses_envoy_field_names() {
        let mut config = EnvoyConfig::new();
        config.add_expose_port("web", 80, 8080).unwrap();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("static_resources:"));
        assert!(yaml.contains("'@type':"));
        assert!(yaml.contains("port_value: 8080"));
        assert!(!yaml.contains("ports:"));
    }

    #[test]
    fn port_mappings_parse_and_reject_garbage() {
        let mut mappings = HashMap::new();
        mappings.insert("web".to_string(), "80:8080".to_string());
        let parsed = parse_port_mappings(&mappings).unwrap();
        assert_eq!(parsed, vec![("web".to_string(), 80, 8080)]);

        mappings.insert("db".to_string(), "nonsense".to_string());
        assert!(parse_port_mappings(&mappings).is_err());
    }
}
