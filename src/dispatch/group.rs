//! Named host groups used as `select=`/`toall=` targets.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Ready hosts of a zone
    Zone,
    /// Hosts carrying the two halves of a VRRP pair
    Vrrp,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKind::Zone => f.write_str("zone"),
            GroupKind::Vrrp => f.write_str("vrrp"),
        }
    }
}

/// `group-<kind>-<id>:<h1>,<h2>,...`
pub fn format_group(kind: GroupKind, id: i64, hosts: &[i64]) -> String {
    let members: Vec<String> = hosts.iter().map(i64::to_string).collect();
    format!("group-{}-{}:{}", kind, id, members.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_group() {
        assert_eq!(format_group(GroupKind::Zone, 1, &[3, 4, 9]), "group-zone-1:3,4,9");
        assert_eq!(format_group(GroupKind::Zone, 0, &[2]), "group-zone-0:2");
    }

    #[test]
    fn test_vrrp_group() {
        assert_eq!(format_group(GroupKind::Vrrp, 12, &[5, 6]), "group-vrrp-12:5,6");
    }
}
