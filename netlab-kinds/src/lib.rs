//! Node kinds shipped with netlab
//!
//! [`build_registry`] registers every kind of this crate. The orchestrator
//! only ever sees them through the `Node` contract of `netlab-core`.

pub mod bridge;
pub mod ceos;
pub mod host;
pub mod linux;
pub mod srl;
pub mod templates;
pub mod vr;

use bridge::BridgeNode;
use ceos::CeosNode;
use host::HostNode;
use linux::LinuxNode;
use netlab_core::config::ReadinessConfig;
use netlab_core::link::LinkEndpointType;
use netlab_core::node::Node;
use netlab_core::{Credentials, KindEntry, KindRegistry, NetlabResult, PlatformHints};
use srl::SrlNode;
use std::sync::Arc;
use std::time::Duration;
use vr::{VrNode, VrPlatform, PLATFORMS};

/// VM platforms take minutes to boot
const VM_READINESS_INTERVAL: Duration = Duration::from_secs(5);
const VM_READINESS_TIMEOUT: Duration = Duration::from_secs(20 * 60);

fn root_namespace_hints(endpoint_type: LinkEndpointType) -> PlatformHints {
    PlatformHints {
        endpoint_type: Some(endpoint_type),
        ..Default::default()
    }
}

fn vr_entry(platform: VrPlatform) -> KindEntry {
    let mut hints = PlatformHints {
        readiness: Some(ReadinessConfig::fixed(
            VM_READINESS_INTERVAL,
            VM_READINESS_TIMEOUT,
        )),
        vm_based: true,
        endpoint_type: Some(LinkEndpointType::Vm),
        ..Default::default()
    };
    hints
        .attributes
        .insert("interface-help".to_string(), platform.interface_help.to_string());

    KindEntry::new(platform.names, move || {
        Arc::new(VrNode::new(platform)) as Arc<dyn Node>
    })
    .with_credentials(platform.credentials())
    .with_interface_format(platform.interface_format)
    .with_platform_hints(hints)
}

/// Registry holding every kind of this crate
pub fn build_registry() -> NetlabResult<KindRegistry> {
    let mut registry = KindRegistry::new();

    registry.register(
        KindEntry::new(&linux::KIND_NAMES, || Arc::new(LinuxNode::new()) as Arc<dyn Node>)
            .with_interface_format("eth{n}"),
    )?;
    registry.register(
        KindEntry::new(&bridge::BRIDGE_KIND_NAMES, || {
            Arc::new(BridgeNode::linux()) as Arc<dyn Node>
        })
        .with_platform_hints(root_namespace_hints(LinkEndpointType::Bridge)),
    )?;
    registry.register(
        KindEntry::new(&bridge::OVS_KIND_NAMES, || {
            Arc::new(BridgeNode::ovs()) as Arc<dyn Node>
        })
        .with_platform_hints(root_namespace_hints(LinkEndpointType::Bridge)),
    )?;
    registry.register(
        KindEntry::new(&host::KIND_NAMES, || Arc::new(HostNode::new()) as Arc<dyn Node>)
            .with_platform_hints(root_namespace_hints(LinkEndpointType::Host)),
    )?;
    registry.register(
        KindEntry::new(&srl::KIND_NAMES, || Arc::new(SrlNode::new()) as Arc<dyn Node>)
            .with_credentials(Credentials::new(srl::DEFAULT_USERNAME, srl::DEFAULT_PASSWORD))
            .with_interface_format("e1-{n}")
            .with_platform_hints(PlatformHints {
                needs_certificate: true,
                ..Default::default()
            }),
    )?;
    registry.register(
        KindEntry::new(&ceos::KIND_NAMES, || Arc::new(CeosNode::new()) as Arc<dyn Node>)
            .with_credentials(Credentials::new(ceos::DEFAULT_USERNAME, ceos::DEFAULT_PASSWORD))
            .with_interface_format("eth{n}"),
    )?;
    for platform in PLATFORMS {
        registry.register(vr_entry(platform))?;
    }

    Ok(registry)
}
