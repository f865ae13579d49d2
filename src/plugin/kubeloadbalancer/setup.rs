use crate::config::PluginConfig;
use crate::dnsutil::{normalize_zone, Fallthrough};
use anyhow::Result;

pub const DEFAULT_TTL: u32 = 5;
pub const MAX_TTL: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub zones: Vec<String>,
    pub ttl: u32,
    pub fall: Fallthrough,
}

/// ```text
/// kubeloadbalancer [ZONES...] {
///     ttl SECONDS
///     fallthrough [ZONES...]
/// }
/// ```
/// Zones default to the server block's zones.
pub fn parse(config: &PluginConfig) -> Result<Settings> {
    let zones: Vec<String> = if config.args.is_empty() {
        config.server_zones.clone()
    } else {
        config.args.iter().map(|z| normalize_zone(z)).collect()
    };
    if zones.is_empty() { anyhow::bail!("no zones configured"); }

    let mut ttl = DEFAULT_TTL;
    let mut fall = Fallthrough::default();

    for sub in &config.block {
        match sub.name.as_str() {
            "fallthrough" => fall = Fallthrough::from_args(&sub.args),
            "ttl" => {
                let arg = sub.args.first().ok_or_else(|| anyhow::anyhow!("ttl needs an argument"))?;
                let t: i64 = arg.parse().map_err(|e| anyhow::anyhow!("invalid ttl '{}': {}", arg, e))?;
                if !(0..=MAX_TTL).contains(&t) {
                    anyhow::bail!("ttl must be in range [0, {}]: {}", MAX_TTL, t);
                }
                ttl = t as u32;
            }
            other => anyhow::bail!("unknown property '{}'", other),
        }
    }

    Ok(Settings { zones, ttl, fall })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(args: &[&str], block: Vec<(&str, Vec<&str>)>) -> PluginConfig {
        PluginConfig {
            name: "kubeloadbalancer".into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            block: block
                .into_iter()
                .map(|(name, args)| PluginConfig { name: name.into(), args: args.into_iter().map(String::from).collect(), ..Default::default() })
                .collect(),
            server_zones: vec!["server.example.".into()],
        }
    }

    #[test]
    fn defaults() {
        let s = parse(&stanza(&[], vec![])).unwrap();
        assert_eq!(s.zones, vec!["server.example.".to_string()]);
        assert_eq!(s.ttl, DEFAULT_TTL);
        assert!(!s.fall.is_enabled());
    }

    #[test]
    fn explicit_zones_are_normalized() {
        let s = parse(&stanza(&["At-Cloud.example.COM", "other.org."], vec![])).unwrap();
        assert_eq!(s.zones, vec!["at-cloud.example.com.".to_string(), "other.org.".to_string()]);
    }

    #[test]
    fn ttl_bounds() {
        assert_eq!(parse(&stanza(&[], vec![("ttl", vec!["0"])])).unwrap().ttl, 0);
        assert_eq!(parse(&stanza(&[], vec![("ttl", vec!["3600"])])).unwrap().ttl, 3600);
        assert!(parse(&stanza(&[], vec![("ttl", vec!["3601"])])).is_err());
        assert!(parse(&stanza(&[], vec![("ttl", vec!["-1"])])).is_err());
        assert!(parse(&stanza(&[], vec![("ttl", vec!["five"])])).is_err());
        assert!(parse(&stanza(&[], vec![("ttl", vec![])])).is_err());
    }

    #[test]
    fn fallthrough_zones() {
        let s = parse(&stanza(&[], vec![("fallthrough", vec!["in-addr.arpa", "server.example"])])).unwrap();
        assert!(s.fall.through("miss.server.example."));
        assert!(!s.fall.through("miss.elsewhere."));

        let all = parse(&stanza(&[], vec![("fallthrough", vec![])])).unwrap();
        assert!(all.fall.through("anything.at.all."));
    }

    #[test]
    fn unknown_property() {
        let err = parse(&stanza(&[], vec![("kubeconfig", vec!["/tmp/x"])])).unwrap_err();
        assert_eq!(err.to_string(), "unknown property 'kubeconfig'");
    }
}
