//! Worker node names (`name@host`) and the `%`-template expansion used by
//! `--hostname`, `--pidfile`, `--statedb` and `--logfile`.

/// Name part used when `--hostname` only names a host.
pub const NODENAME_DEFAULT: &str = "worker";

/// Host name of this machine, `localhost` if it cannot be read.
pub fn gethostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Splits `name@host`. A value without `@` is all host.
pub fn nodesplit(nodename: &str) -> (Option<&str>, &str) {
    match nodename.split_once('@') {
        Some((name, host)) => (Some(name), host),
        None => (None, nodename),
    }
}

pub fn nodename(name: &str, host: &str) -> String {
    format!("{name}@{host}")
}

/// Fills in whichever of the name and host parts are missing.
pub fn default_nodename(raw: Option<&str>, system_host: &str) -> String {
    let (name, host) = raw.map(nodesplit).unwrap_or((None, ""));
    let name = name.filter(|n| !n.is_empty()).unwrap_or(NODENAME_DEFAULT);
    let host = if host.is_empty() { system_host } else { host };
    nodename(name, host)
}

/// Expands `%h` (host), `%n` (name, defaults to the first label of the host),
/// `%d` (domain) and any `extra` keys. `%%` is a literal percent sign.
pub fn host_format(template: &str, host: &str, name: Option<&str>, extra: &[(char, &str)]) -> String {
    let (short, domain) = host.split_once('.').unwrap_or((host, ""));
    let mut keys = vec![('h', host), ('n', name.unwrap_or(short)), ('d', domain)];
    keys.extend_from_slice(extra);
    simple_format(template, &keys)
}

/// Expands a file name template for the node `nodename`. `%p` is the full node
/// name; `%i` and `%I` are left for the pool to expand per process.
pub fn node_format(template: &str, nodename: &str) -> String {
    let (name, host) = nodesplit(nodename);
    host_format(
        template,
        host,
        Some(name.unwrap_or(NODENAME_DEFAULT)),
        &[('p', nodename)],
    )
}

/// Resolves the `--hostname` option value against this machine's host name.
pub fn hostname_option(raw: Option<&str>) -> String {
    hostname_option_with(raw, &gethostname())
}

pub fn hostname_option_with(raw: Option<&str>, system_host: &str) -> String {
    host_format(&default_nodename(raw, system_host), system_host, None, &[])
}

fn simple_format(template: &str, keys: &[(char, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(key) => match keys.iter().find(|(k, _)| *k == key) {
                Some((_, value)) => out.push_str(value),
                None => {
                    out.push('%');
                    out.push(key);
                }
            },
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "george.example.com";

    #[test]
    fn test_host_format_expands_parts() {
        assert_eq!(host_format("w1@%h", HOST, None, &[]), "w1@george.example.com");
        assert_eq!(host_format("%n.%d", HOST, None, &[]), "george.example.com");
        assert_eq!(host_format("w-%n", HOST, None, &[]), "w-george");
        assert_eq!(host_format("100%%", HOST, None, &[]), "100%");
    }

    #[test]
    fn test_host_format_keeps_unknown_keys() {
        assert_eq!(host_format("/var/run/%n-%i.pid", HOST, None, &[]), "/var/run/george-%i.pid");
        assert_eq!(host_format("trailing%", HOST, None, &[]), "trailing%");
    }

    #[test]
    fn test_expansion_idempotent_without_tokens() {
        for raw in ["w1@george", "plain", "a.b@c.d"] {
            let once = hostname_option_with(Some(raw), HOST);
            assert_eq!(hostname_option_with(Some(&once), HOST), once);
            assert_eq!(host_format(&once, HOST, None, &[]), once);
        }
    }

    #[test]
    fn test_default_nodename() {
        assert_eq!(default_nodename(None, HOST), "worker@george.example.com");
        assert_eq!(default_nodename(Some("w1"), HOST), "worker@w1");
        assert_eq!(default_nodename(Some("w1@"), HOST), "w1@george.example.com");
        assert_eq!(default_nodename(Some("@box"), HOST), "worker@box");
    }

    #[test]
    fn test_hostname_option() {
        assert_eq!(hostname_option_with(Some("w1@%h"), HOST), "w1@george.example.com");
        assert_eq!(hostname_option_with(Some("w1@%n"), HOST), "w1@george");
        assert_eq!(hostname_option_with(None, HOST), "worker@george.example.com");
    }

    #[test]
    fn test_node_format() {
        let node = "w1@george.example.com";
        assert_eq!(node_format("/var/run/%n.pid", node), "/var/run/w1.pid");
        assert_eq!(node_format("%h.db", node), "george.example.com.db");
        assert_eq!(node_format("%p-%i.log", node), "w1@george.example.com-%i.log");
        assert_eq!(node_format("%n.pid", "george"), "worker.pid");
    }

    #[test]
    fn test_gethostname_not_empty() {
        assert!(!gethostname().is_empty());
    }
}
