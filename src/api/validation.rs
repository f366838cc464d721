//! Input validation for API requests.
//!
//! Validators return `Result<(), String>` with a user-facing message. The
//! admin layer wraps failures as `InvalidParameter` errors.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Resource names: letters, digits, `.`, `_` and `-`, starting alphanumeric
    static ref NAME_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9][a-zA-Z0-9._-]*$"
    ).unwrap();

    /// RFC 1123 host label
    static ref HOSTNAME_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?$"
    ).unwrap();

    /// Host part of a backend address: IPv4 or DNS name
    static ref HOST_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*$"
    ).unwrap();
}

/// Validate a resource name (load balancers, listeners, routers, users...)
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name is required".to_string());
    }

    if name.len() > 64 {
        return Err("Name is too long (max 64 characters)".to_string());
    }

    if !NAME_REGEX.is_match(name) {
        return Err(
            "Name must start with a letter or digit and contain only letters, digits, '.', '_' and '-'"
                .to_string(),
        );
    }

    Ok(())
}

/// Validate an instance hostname prefix
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("Hostname is required".to_string());
    }

    // leaves room for the `-<n>` suffix of batch creates
    if hostname.len() > 60 {
        return Err("Hostname is too long (max 60 characters)".to_string());
    }

    if !HOSTNAME_REGEX.is_match(hostname) {
        return Err("Hostname must be alphanumeric with dashes".to_string());
    }

    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.len() < 8 {
        return Err("Password must be at least 8 characters".to_string());
    }
    if password.len() > 128 {
        return Err("Password is too long (max 128 characters)".to_string());
    }
    Ok(())
}

/// Validate a port number
pub fn validate_port(port: i64) -> Result<(), String> {
    if !(1..=65535).contains(&port) {
        return Err("Port must be between 1 and 65535".to_string());
    }
    Ok(())
}

/// Validate a `host:port` backend address
pub fn validate_backend_addr(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| "Backend address must be in host:port form".to_string())?;

    if host.is_empty() || host.len() > 253 || !HOST_REGEX.is_match(host) {
        return Err(format!("Invalid backend host: {}", host));
    }

    let port: i64 = port
        .parse()
        .map_err(|_| format!("Invalid backend port: {}", port))?;
    validate_port(port)
}

pub fn validate_os_code(os_code: &str) -> Result<(), String> {
    match os_code {
        "linux" | "windows" => Ok(()),
        _ => Err("os_code must be 'linux' or 'windows'".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web-lb").is_ok());
        assert!(validate_name("api_v2.internal").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("web").is_ok());
        assert!(validate_hostname("web-01").is_ok());
        assert!(validate_hostname("web_01").is_err());
        assert!(validate_hostname("web-").is_err());
    }

    #[test]
    fn test_validate_port() {
        assert!(validate_port(80).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(70000).is_err());
    }

    #[test]
    fn test_validate_backend_addr() {
        assert!(validate_backend_addr("10.0.0.5:8080").is_ok());
        assert!(validate_backend_addr("app.internal:80").is_ok());
        assert!(validate_backend_addr("10.0.0.5").is_err());
        assert!(validate_backend_addr("10.0.0.5:0").is_err());
        assert!(validate_backend_addr(":80").is_err());
        assert!(validate_backend_addr("bad host:80").is_err());
    }

    #[test]
    fn test_validate_os_code() {
        assert!(validate_os_code("linux").is_ok());
        assert!(validate_os_code("plan9").is_err());
    }
}
