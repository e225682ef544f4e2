//! Text artifacts derived from a tunnel: the server-side OpenVPN config,
//! the mirrored client config, and the self-contained bootstrap script a
//! client host pipes into a shell.

use crate::model::Tunnel;
use crate::settings::Settings;

pub fn server_conf(tunnel: &Tunnel, settings: &Settings) -> String {
    [
        format!("dev {}", tunnel.name(settings)),
        "dev-type tun".to_string(),
        format!("port {}", tunnel.port(settings)),
        format!("ifconfig {} {}", tunnel.server, tunnel.client),
        format!("secret {}", tunnel.key_path(settings).display()),
    ]
    .join("\n")
}

/// Same link seen from the remote side: the endpoint pair swaps and the
/// config gains the `remote` directive pointing back at us.
pub fn client_conf(tunnel: &Tunnel, settings: &Settings) -> String {
    [
        format!("remote {}", settings.remote_address),
        format!("dev {}", tunnel.name(settings)),
        "dev-type tun".to_string(),
        format!("port {}", tunnel.port(settings)),
        format!("ifconfig {} {}", tunnel.client, tunnel.server),
        format!("secret {}", tunnel.key_path(settings).display()),
    ]
    .join("\n")
}

pub fn client_script(tunnel: &Tunnel, settings: &Settings) -> String {
    let name = tunnel.name(settings);
    let key_path = tunnel.key_path(settings).display().to_string();
    let conf_path = tunnel.conf_path(settings).display().to_string();
    let key = tunnel.key.trim_end();
    let conf = client_conf(tunnel, settings);
    format!(
        r#"#!/bin/sh

if ! command -v openvpn > /dev/null 2>&1; then
    if command -v apt-get > /dev/null 2>&1; then
        apt-get update && apt-get install -y openvpn
    elif command -v yum > /dev/null 2>&1; then
        yum install -y openvpn
    elif command -v zypper > /dev/null 2>&1; then
        zypper --non-interactive install openvpn
    else
        echo "Couldn't find a package manager to install OpenVPN." >&2
        exit 1
    fi
fi

cat > {key_path} << 'EOF'
{key}
EOF
chmod 600 {key_path}

cat > {conf_path} << 'EOF'
{conf}
EOF

if command -v systemctl > /dev/null 2>&1; then
    systemctl restart openvpn@{name}
else
    service openvpn restart {name}
fi

echo 1 > /proc/sys/net/ipv4/ip_forward

eth_ifaces=$(ip -o link show | awk -F': ' '{{print $2}}' | grep '^eth')
for iface in $eth_ifaces; do
    iptables -t nat -A POSTROUTING -o "$iface" -j MASQUERADE
done
"#
    )
}
