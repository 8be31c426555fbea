//! Interface name validation and vendor alias mapping

use crate::config::MAX_INTERFACE_NAME_LEN;
use crate::error::{NetlabError, NetlabResult};
use crate::link::Endpoint;
use regex::Regex;

const GENERIC_VM_INTERFACE: &str = r"^eth[1-9]\d*$";

/// `eth` followed by a number without leading zero, starting at 1
fn is_generic_vm_interface(name: &str) -> bool {
    match name.strip_prefix("eth") {
        Some(index) => {
            !index.is_empty()
                && !index.starts_with('0')
                && index.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Kernel constraints every interface name must satisfy
pub fn validate_kernel_name(node: &str, name: &str) -> NetlabResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty".to_string())
    } else if name.len() > MAX_INTERFACE_NAME_LEN {
        Some(format!(
            "name is {} bytes long, the kernel limit is {}",
            name.len(),
            MAX_INTERFACE_NAME_LEN
        ))
    } else if name == "." || name == ".." {
        Some("name is reserved".to_string())
    } else if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        Some("name must not contain '/', ':' or whitespace".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(NetlabError::interface_invalid(node, name, reason)),
        None => Ok(()),
    }
}

/// Check used by VM-in-container kinds: data interfaces must be `eth1`, `eth2`, ...
///
/// All offending names are listed in one error.
pub fn generic_vm_interface_check(node: &str, endpoints: &[Endpoint]) -> NetlabResult<()> {
    let bad: Vec<&str> = endpoints
        .iter()
        .map(|ep| ep.interface.as_str())
        .filter(|name| !is_generic_vm_interface(name))
        .collect();
    if bad.is_empty() {
        return Ok(());
    }
    Err(NetlabError::interface_invalid(
        node,
        bad.join(", "),
        format!(
            "interface names must match {} (eth1, eth2, ...), offending: {:?}",
            GENERIC_VM_INTERFACE,
            bad
        ),
    ))
}

/// Maps vendor interface aliases (e.g. `ge-0/0/2`, `Ethernet1/3`) to `ethN`
#[derive(Debug, Clone)]
pub struct InterfaceMapping {
    pattern: Regex,
    offset: u32,
    help: String,
}

impl InterfaceMapping {
    /// `pattern` must contain a `(?P<port>\d+)` capture group
    pub fn new(pattern: &str, offset: u32, help: impl Into<String>) -> NetlabResult<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            NetlabError::configuration("interface_mapping", format!("invalid pattern: {}", e))
        })?;
        if !pattern.capture_names().any(|n| n == Some("port")) {
            return Err(NetlabError::configuration(
                "interface_mapping",
                format!("pattern {} has no `port` capture group", pattern.as_str()),
            ));
        }
        Ok(Self {
            pattern,
            offset,
            help: help.into(),
        })
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    /// Mapped `ethN` for an alias, `None` when `name` is not an alias
    pub fn map(&self, node: &str, name: &str) -> NetlabResult<Option<String>> {
        let Some(caps) = self.pattern.captures(name) else {
            return Ok(None);
        };
        let port: u32 = caps
            .name("port")
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| NetlabError::interface_invalid(node, name, self.help.clone()))?;

        if port < self.offset {
            return Err(NetlabError::interface_invalid(
                node,
                name,
                format!("port index must be at least {}. {}", self.offset, self.help),
            ));
        }
        Ok(Some(format!("eth{}", port - self.offset + 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkEndpointType;
    use test_case::test_case;

    #[test_case("eth1", true; "plain")]
    #[test_case("e1-1", true; "srl style")]
    #[test_case("", false; "empty")]
    #[test_case("averyveryverylongname", false; "too long")]
    #[test_case("ethernet-1/1", false; "slash")]
    #[test_case("eth 1", false; "whitespace")]
    fn test_kernel_name(name: &str, valid: bool) {
        assert_eq!(validate_kernel_name("r1", name).is_ok(), valid);
    }

    #[test]
    fn test_generic_vm_check_lists_all_offenders() {
        let eps = vec![
            Endpoint::new("vm1", "eth1", LinkEndpointType::Vm),
            Endpoint::new("vm1", "eth0", LinkEndpointType::Vm),
            Endpoint::new("vm1", "ge-0/0/1", LinkEndpointType::Vm),
        ];
        let err = generic_vm_interface_check("vm1", &eps).unwrap_err().to_string();
        assert!(err.contains("eth0"));
        assert!(err.contains("ge-0/0/1"));
        assert!(generic_vm_interface_check("vm1", &eps[..1]).is_ok());
    }

    #[test]
    fn test_mapping_with_offset() {
        let sros = InterfaceMapping::new(r"^1/1/(?P<port>\d+)$", 1, "use 1/1/X with X >= 1").unwrap();
        assert_eq!(sros.map("r1", "1/1/3").unwrap().as_deref(), Some("eth3"));
        assert_eq!(sros.map("r1", "eth3").unwrap(), None);
        let err = sros.map("r1", "1/1/0").unwrap_err().to_string();
        assert!(err.contains("use 1/1/X"));

        let vmx = InterfaceMapping::new(r"^(et|xe|ge)-0/0/(?P<port>\d+)$", 0, "").unwrap();
        assert_eq!(vmx.map("r1", "ge-0/0/0").unwrap().as_deref(), Some("eth1"));
    }

    #[test]
    fn test_mapping_requires_port_group() {
        assert!(InterfaceMapping::new(r"^1/1/\d+$", 1, "").is_err());
    }
}
