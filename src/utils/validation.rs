/// Request field validation for incoming lifecycle events.
pub struct InputValidator;

/// Kernel IFNAMSIZ budget (15 usable chars plus NUL)
const MAX_IFNAME_LEN: usize = 15;

impl InputValidator {
    /// Container IDs come from the runtime; only pass through sane ones so
    /// they can be embedded in interface names and cache keys.
    pub fn validate_container_id(container_id: &str) -> Result<(), String> {
        if container_id.is_empty() {
            return Err("container id must not be empty".to_string());
        }
        if !container_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(format!(
                "container id '{}' contains invalid characters",
                container_id
            ));
        }
        Ok(())
    }

    pub fn validate_interface_name(name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("interface name must not be empty".to_string());
        }
        if name.len() > MAX_IFNAME_LEN {
            return Err(format!(
                "interface name '{}' exceeds {} characters",
                name, MAX_IFNAME_LEN
            ));
        }
        if name.contains('/') || name.chars().any(|c| c.is_whitespace()) {
            return Err(format!("interface name '{}' contains invalid characters", name));
        }
        Ok(())
    }

    /// Namespace paths must be absolute; the agent opens them with its own
    /// privileges.
    pub fn validate_netns_path(path: &str) -> Result<(), String> {
        if path.is_empty() {
            return Err("network namespace path must not be empty".to_string());
        }
        if !path.starts_with('/') {
            return Err(format!("network namespace path '{}' must be absolute", path));
        }
        Ok(())
    }

    /// Parse key=value pairs from strings
    pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
        let pos = s
            .find('=')
            .ok_or_else(|| format!("Invalid KEY=VALUE format: '{}'", s))?;

        let key = s[..pos].trim().to_string();
        let value = s[pos + 1..].trim().to_string();

        if key.is_empty() {
            return Err("Empty key in KEY=VALUE pair".to_string());
        }

        Ok((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_validation() {
        InputValidator::validate_container_id("0ca1893b5e7f").unwrap();
        InputValidator::validate_container_id("pod-infra_1.2").unwrap();
        assert!(InputValidator::validate_container_id("").is_err());
        assert!(InputValidator::validate_container_id("bad id").is_err());
        assert!(InputValidator::validate_container_id("bad;id").is_err());
    }

    #[test]
    fn interface_name_validation() {
        InputValidator::validate_interface_name("eth0").unwrap();
        InputValidator::validate_interface_name("weft-0a1b2c3d4e").unwrap();
        assert!(InputValidator::validate_interface_name("").is_err());
        assert!(InputValidator::validate_interface_name("waytoolonginterface").is_err());
        assert!(InputValidator::validate_interface_name("eth 0").is_err());
        assert!(InputValidator::validate_interface_name("eth/0").is_err());
    }

    #[test]
    fn netns_path_validation() {
        InputValidator::validate_netns_path("/proc/42/ns/net").unwrap();
        assert!(InputValidator::validate_netns_path("").is_err());
        assert!(InputValidator::validate_netns_path("proc/42/ns/net").is_err());
    }

    #[test]
    fn key_val_parsing() {
        assert_eq!(
            InputValidator::parse_key_val("K8S_POD_NAME=coredns").unwrap(),
            ("K8S_POD_NAME".to_string(), "coredns".to_string())
        );
        assert!(InputValidator::parse_key_val("novalue").is_err());
        assert!(InputValidator::parse_key_val("=x").is_err());
    }
}
