//! Service domain table.
//!
//! The proxy intercepts a fixed umbrella of game-service hostnames; every
//! other destination tunnels through untouched. The set is known at build
//! time and immutable.

/// Root umbrella domain.
pub const ROOT_DOMAIN: &str = "frontier-games.net";

/// Suffix shared by all service sub-domains.
pub const SERVICE_SUFFIX: &str = ".svc.frontier-games.net";

/// An enumerated upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// The umbrella web host.
    Root,
    /// Player/game settings service.
    Settings,
    /// Content-management service (carries the volatile `flight` query
    /// parameter).
    GameCms,
    /// UGC discovery service.
    Discovery,
    /// Store/economy service.
    Economy,
    /// Match stats service.
    Stats,
    /// Player profile service.
    Profile,
}

impl Domain {
    /// All known domains, in registration order.
    pub const ALL: &'static [Domain] = &[
        Domain::Root,
        Domain::Settings,
        Domain::GameCms,
        Domain::Discovery,
        Domain::Economy,
        Domain::Stats,
        Domain::Profile,
    ];

    /// Canonical hostname for this service.
    pub fn host(&self) -> &'static str {
        match self {
            Domain::Root => "www.frontier-games.net",
            Domain::Settings => "settings.svc.frontier-games.net",
            Domain::GameCms => "gamecms.svc.frontier-games.net",
            Domain::Discovery => "discovery.svc.frontier-games.net",
            Domain::Economy => "economy.svc.frontier-games.net",
            Domain::Stats => "stats.svc.frontier-games.net",
            Domain::Profile => "profile.svc.frontier-games.net",
        }
    }

    /// Section name used in `mitm.yaml`.
    pub fn config_key(&self) -> &'static str {
        match self {
            Domain::Root => "root",
            Domain::Settings => "settings",
            Domain::GameCms => "gamecms",
            Domain::Discovery => "discovery",
            Domain::Economy => "economy",
            Domain::Stats => "stats",
            Domain::Profile => "profile",
        }
    }

    /// Resolves a config section name.
    pub fn from_config_key(key: &str) -> Option<Domain> {
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.config_key() == key)
    }

    /// Resolves a hostname (port-tolerant) to a known domain.
    pub fn from_host(host: &str) -> Option<Domain> {
        let host = strip_port(host);
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.host().eq_ignore_ascii_case(host))
    }
}

/// Checks whether a destination host falls under the intercepted umbrella.
pub fn is_intercepted_host(host: &str) -> bool {
    let host = strip_port(host).to_ascii_lowercase();
    host == ROOT_DOMAIN
        || host.ends_with(SERVICE_SUFFIX)
        || host.ends_with(&format!(".{}", ROOT_DOMAIN))
}

/// Removes a trailing `:port`, if any.
pub fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umbrella_hosts_are_intercepted() {
        assert!(is_intercepted_host("frontier-games.net"));
        assert!(is_intercepted_host("www.frontier-games.net"));
        assert!(is_intercepted_host("settings.svc.frontier-games.net"));
        assert!(is_intercepted_host("gamecms.svc.frontier-games.net:443"));
        assert!(is_intercepted_host("SETTINGS.SVC.FRONTIER-GAMES.NET"));
    }

    #[test]
    fn other_hosts_pass_through() {
        assert!(!is_intercepted_host("example.com"));
        assert!(!is_intercepted_host("frontier-games.net.evil.com"));
        assert!(!is_intercepted_host("notfrontier-games.net"));
    }

    #[test]
    fn from_host_resolves_known_services() {
        assert_eq!(
            Domain::from_host("settings.svc.frontier-games.net"),
            Some(Domain::Settings)
        );
        assert_eq!(
            Domain::from_host("gamecms.svc.frontier-games.net:443"),
            Some(Domain::GameCms)
        );
        assert_eq!(Domain::from_host("unknown.svc.frontier-games.net"), None);
    }

    #[test]
    fn config_keys_round_trip() {
        for domain in Domain::ALL {
            assert_eq!(Domain::from_config_key(domain.config_key()), Some(*domain));
        }
        assert_eq!(Domain::from_config_key("nope"), None);
    }

    #[test]
    fn strip_port_works() {
        assert_eq!(strip_port("host:443"), "host");
        assert_eq!(strip_port("host"), "host");
    }
}
