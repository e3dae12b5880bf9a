//! Relay interface config rendering

use super::RelayTunnel;

/// Render the `wg-quick` config for a relay interface
///
/// `Table = off` keeps `wg-quick` from installing the relay's default route
/// in the main table. Policy routing decides what goes through the relay.
pub fn render_interface_config(relay: &RelayTunnel) -> String {
    let mut lines = vec![
        "[Interface]".to_string(),
        format!("PrivateKey = {}", relay.private_key),
    ];
    if let Some(address) = &relay.address {
        lines.push(format!("Address = {address}"));
    }
    if let Some(mtu) = relay.mtu {
        lines.push(format!("MTU = {mtu}"));
    }
    lines.push("Table = off".to_string());

    lines.push(String::new());
    lines.push("[Peer]".to_string());
    lines.push(format!("PublicKey = {}", relay.peer_public_key));
    if let Some(psk) = &relay.preshared_key {
        lines.push(format!("PresharedKey = {psk}"));
    }
    lines.push(format!(
        "AllowedIPs = {}",
        relay.effective_allowed_ips().join(", ")
    ));
    lines.push(format!("Endpoint = {}", relay.endpoint));
    if let Some(keepalive) = relay.persistent_keepalive {
        lines.push(format!("PersistentKeepalive = {keepalive}"));
    }

    let mut content = lines.join("\n");
    content.push('\n');
    content
}
