//! Interface normalization: offloads off, addresses gone.
//!
//! Offload features (checksum and segmentation offload and friends) let the
//! driver batch or fix up packets behind the measurement's back, and stale
//! addresses let the kernel answer traffic meant for the program under test.
//! Both are removed before any capture starts. Every command failure is
//! surfaced, never ignored.

use crate::backend::Backend;
use crate::error::Result;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// `ethtool -K` feature names to turn off.
    pub offloads: Vec<String>,
    pub flush_addresses: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            offloads: vec!["tx".into(), "rx".into()],
            flush_addresses: true,
        }
    }
}

/// Disable one offload feature on an interface.
pub fn disable_offload<B: Backend>(
    session: &mut Session<B>,
    endpoint: &str,
    index: usize,
    feature: &str,
) -> Result<()> {
    let iface = session.resolve_interface(endpoint, index)?;
    session.exec_checked(endpoint, "ethtool", &["-K", &iface.name, feature, "off"])?;
    tracing::debug!(endpoint, interface = %iface.name, feature, "offload disabled");
    Ok(())
}

/// Flush every IPv4 and IPv6 address from an interface.
pub fn flush_addresses<B: Backend>(
    session: &mut Session<B>,
    endpoint: &str,
    index: usize,
) -> Result<()> {
    let iface = session.resolve_interface(endpoint, index)?;
    session.exec_checked(endpoint, "ip", &["addr", "flush", "dev", &iface.name])?;
    session.exec_checked(endpoint, "ip", &["-6", "addr", "flush", "dev", &iface.name])?;
    tracing::debug!(endpoint, interface = %iface.name, "addresses flushed");
    Ok(())
}

/// Apply `options` to one interface. Safe to repeat.
pub fn normalize_interface<B: Backend>(
    session: &mut Session<B>,
    endpoint: &str,
    index: usize,
    options: &NormalizeOptions,
) -> Result<()> {
    for feature in &options.offloads {
        disable_offload(session, endpoint, index, feature)?;
    }
    if options.flush_addresses {
        flush_addresses(session, endpoint, index)?;
    }
    Ok(())
}

/// Apply `options` to every interface of an endpoint.
pub fn normalize_endpoint<B: Backend>(
    session: &mut Session<B>,
    endpoint: &str,
    options: &NormalizeOptions,
) -> Result<()> {
    let count = session
        .topology()
        .endpoint(endpoint)
        .map(|e| e.interfaces.len())
        .ok_or_else(|| crate::error::Error::InterfaceNotFound {
            endpoint: endpoint.to_string(),
            interface: "*".to_string(),
        })?;
    for index in 0..count {
        normalize_interface(session, endpoint, index, options)?;
    }
    tracing::info!(
        endpoint,
        interfaces = count,
        offloads = ?options.offloads,
        flushed = options.flush_addresses,
        "endpoint normalized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::session::SessionOptions;
    use crate::test_util::RecordingBackend;
    use crate::topology::{LinkShaping, Topology};
    use std::time::Duration;

    fn started(backend: &RecordingBackend) -> Session<RecordingBackend> {
        let topo = Topology::builder()
            .endpoint("A")
            .endpoint("B")
            .link("A", "B", LinkShaping::new(100, Duration::from_millis(100)))
            .build()
            .unwrap();
        let mut session = Session::new(topo, backend.clone(), SessionOptions::default());
        session.start().unwrap();
        session
    }

    #[test]
    fn normalization_disables_offloads_and_clears_addresses() {
        let backend = RecordingBackend::new();
        let mut session = started(&backend);

        normalize_interface(&mut session, "A", 0, &NormalizeOptions::default()).unwrap();

        assert_eq!(backend.offload("A-eth0", "tx"), Some(false));
        assert_eq!(backend.offload("A-eth0", "rx"), Some(false));
        assert_eq!(backend.offload("A-eth0", "sg"), Some(true));
        assert!(session.addresses("A", 0).unwrap().is_empty());
        // The peer is untouched.
        assert!(!session.addresses("B", 0).unwrap().is_empty());
    }

    #[test]
    fn normalization_is_idempotent() {
        let backend = RecordingBackend::new();
        let mut session = started(&backend);
        let options = NormalizeOptions::default();

        normalize_interface(&mut session, "B", 0, &options).unwrap();
        let once = (
            backend.offload("B-eth0", "tx"),
            backend.offload("B-eth0", "rx"),
            backend.addresses("B-eth0"),
        );
        normalize_interface(&mut session, "B", 0, &options).unwrap();
        let twice = (
            backend.offload("B-eth0", "tx"),
            backend.offload("B-eth0", "rx"),
            backend.addresses("B-eth0"),
        );
        assert_eq!(once, twice);
        assert_eq!(twice, (Some(false), Some(false), Vec::<String>::new()));
    }

    #[test]
    fn missing_interface_is_reported() {
        let backend = RecordingBackend::new();
        let mut session = started(&backend);

        let err = normalize_interface(&mut session, "A", 1, &NormalizeOptions::default())
            .unwrap_err();
        assert!(
            matches!(err, Error::InterfaceNotFound { ref interface, .. } if interface == "A-eth1"),
            "{err}"
        );

        let err = normalize_endpoint(&mut session, "Z", &NormalizeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound { .. }));
    }

    #[test]
    fn interface_gone_from_live_endpoint_is_reported() {
        let backend = RecordingBackend::new();
        let mut session = started(&backend);
        backend.remove_interface("A-eth0");

        let err = flush_addresses(&mut session, "A", 0).unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound { .. }), "{err}");
    }

    #[test]
    fn unsupported_offload_fails_with_command_output() {
        let backend = RecordingBackend::new();
        let mut session = started(&backend);

        let options = NormalizeOptions {
            offloads: vec!["warp-drive".into()],
            flush_addresses: false,
        };
        let err = normalize_interface(&mut session, "A", 0, &options).unwrap_err();
        match err {
            Error::CommandExecution {
                command,
                status,
                stderr,
                ..
            } => {
                assert_eq!(command, "ethtool -K A-eth0 warp-drive off");
                assert_eq!(status, Some(1));
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn normalizing_a_stopped_session_is_rejected() {
        let backend = RecordingBackend::new();
        let mut session = started(&backend);
        session.stop().unwrap();
        let err = normalize_endpoint(&mut session, "A", &NormalizeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
