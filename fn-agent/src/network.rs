use tokio::process::Command;
use tracing::{info, warn};

use crate::paths::{Layout, PRIMARY_INTERFACE};

/// Commands and resolver contents derived from the network parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    /// Arguments to `ip`, one invocation per entry, in order.
    pub commands: Vec<Vec<String>>,
    /// New `/etc/resolv.conf`, when DNS servers were supplied.
    pub resolv_conf: Option<String>,
    pub has_route: bool,
}

/// Build the configuration for an address. `None` when no address is
/// assigned, in which case nothing is configured.
pub fn plan(ip: Option<&str>, route: Option<&str>, dns_servers: &[String]) -> Option<NetworkPlan> {
    let ip = ip.filter(|ip| !ip.is_empty())?;
    let route = route.filter(|r| !r.is_empty());

    let mut commands: Vec<Vec<String>> = [
        vec!["addr", "add", "127.0.0.1/8", "dev", "lo", "brd", "+", "scope", "host"],
        vec!["addr", "add", "::1/128", "dev", "lo"],
        vec!["link", "set", "lo", "up"],
    ]
    .into_iter()
    .map(|args| args.into_iter().map(String::from).collect())
    .collect();

    commands.push(vec![
        "addr".into(),
        "add".into(),
        format!("{}/24", ip),
        "dev".into(),
        PRIMARY_INTERFACE.into(),
    ]);
    commands.push(vec![
        "link".into(),
        "set".into(),
        PRIMARY_INTERFACE.into(),
        "up".into(),
    ]);
    if let Some(route) = route {
        commands.push(vec![
            "route".into(),
            "add".into(),
            "default".into(),
            "via".into(),
            route.into(),
            "dev".into(),
            PRIMARY_INTERFACE.into(),
        ]);
    }

    Some(NetworkPlan {
        commands,
        resolv_conf: resolv_conf(dns_servers),
        has_route: route.is_some(),
    })
}

fn resolv_conf(dns_servers: &[String]) -> Option<String> {
    if dns_servers.is_empty() {
        return None;
    }
    Some(
        dns_servers
            .iter()
            .map(|server| format!("nameserver {}\n", server))
            .collect(),
    )
}

/// Configure loopback and the primary interface.
///
/// Skipped entirely when the guest has no primary interface or no address
/// was assigned. Individual command failures are logged.
pub async fn configure(
    ip: Option<&str>,
    route: Option<&str>,
    dns_servers: &[String],
    layout: &Layout,
) {
    if !layout.primary_interface().exists() {
        info!("no {} interface, skipping network setup", PRIMARY_INTERFACE);
        return;
    }
    let Some(plan) = plan(ip, route, dns_servers) else {
        info!("no IP address assigned, skipping network setup");
        return;
    };

    for args in &plan.commands {
        match Command::new("ip").args(args).output().await {
            Ok(o) if o.status.success() => {}
            Ok(o) => warn!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&o.stderr).trim()
            ),
            Err(e) => warn!("failed to run ip {}: {}", args.join(" "), e),
        }
    }
    if !plan.has_route {
        warn!("no default route given, the guest has no outbound network");
    }

    if let Some(contents) = &plan.resolv_conf {
        let path = layout.resolv_conf();
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&path, contents).await {
            warn!(path = %path.display(), "failed to write resolver configuration: {}", e);
        }
    }
    info!(ip = ip, route = route, "network configured");
}
