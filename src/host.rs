use std::net::{IpAddr, UdpSocket};

/// Preferred outbound address of this machine.
///
/// Connecting a UDP socket sends no packets; it only asks the kernel which local
/// address would be used to reach a public host.
pub fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

/// The address the control plane should fetch from: the detected outbound
/// address when there is one, otherwise the configured address.
pub fn resolve(configured: &str) -> String {
    match outbound_ip() {
        Ok(ip) if !ip.is_unspecified() => ip.to_string(),
        _ => configured.to_string(),
    }
}
