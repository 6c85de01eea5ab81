//! Ping probe implementation with native ICMP (high-precision) and command fallback.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{PingOutcome, ProbeError};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique identifier for each echo request so concurrent
/// checks against the same destination can be told apart.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Run one reachability check: `count` echo requests against the address.
///
/// Lost packets are counted, not fatal: a host that answers nothing yields
/// an outcome with zero packets received, never an error. Errors are
/// reserved for checks that could not be executed at all.
pub async fn run_ping(
    address: &str,
    count: u32,
    timeout: Duration,
) -> Result<PingOutcome, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        // Resolve address before spawn_blocking (DNS is async)
        let ip = resolve_address(address).await?;
        let addr_str = address.to_string();

        // Run blocking ICMP in dedicated thread for precise timing
        let result = tokio::task::spawn_blocking(move || run_blocking_check(ip, count, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                // Check if this is a permission error
                let error_str = format!("{:?}", e);
                if error_str.contains("Permission")
                    || error_str.contains("Operation not permitted")
                    || error_str.contains("denied")
                {
                    tracing::warn!(
                        "Native ping failed with permission error for {}, falling back to command: {}",
                        addr_str,
                        error_str
                    );
                    return run_ping_command(&addr_str, count, timeout).await;
                }
                return Err(e);
            }
        }
    }

    // Fallback to command execution
    run_ping_command(address, count, timeout).await
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    // DNS resolution
    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Run a full blocking check: one socket, `count` sequential echoes.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_check(
    ip: IpAddr,
    count: u32,
    timeout: Duration,
) -> Result<PingOutcome, ProbeError> {
    let socket = open_icmp_socket(ip)?;
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let mut rtts_ms = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match echo_once(&socket, ip, timeout) {
            Ok(rtt_ms) => rtts_ms.push(rtt_ms),
            // A lost packet is data, not a failure.
            Err(ProbeError::Timeout(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(PingOutcome::from_rtts(count, &rtts_ms))
}

fn open_icmp_socket(ip: IpAddr) -> Result<Socket, ProbeError> {
    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))
}

/// Send one echo request and wait for its matching reply, returning the
/// round-trip time in milliseconds.
fn echo_once(socket: &Socket, ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (identifier, sequence) = generate_ping_id();
    let packet = match ip {
        IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
        IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
    };

    // Start timing just before send
    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Receive reply - loop until we get OUR reply or timeout
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        // Stop timing immediately after receive
        let elapsed = start.elapsed();

        // Check if we've exceeded timeout
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if reply_matches(buf, ip, identifier, sequence) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
        // Received something else, keep waiting
    }
}

/// Verify a received packet is the echo reply for our (id, seq).
fn reply_matches(buf: &[u8], ip: IpAddr, identifier: u16, sequence: u16) -> bool {
    if buf.len() < 8 {
        return false;
    }
    match ip {
        IpAddr::V4(_) => {
            // For DGRAM sockets we get just the ICMP header; for RAW
            // sockets the IP header precedes it.
            let icmp_offset = if buf[0] >> 4 == 4 { 20 } else { 0 };
            if buf.len() <= icmp_offset + 7 {
                return false;
            }
            let reply_type = buf[icmp_offset];
            let reply_id = u16::from_be_bytes([buf[icmp_offset + 4], buf[icmp_offset + 5]]);
            let reply_seq = u16::from_be_bytes([buf[icmp_offset + 6], buf[icmp_offset + 7]]);
            // ICMP type 0 = Echo Reply
            reply_type == 0 && reply_id == identifier && reply_seq == sequence
        }
        IpAddr::V6(_) => {
            let reply_type = buf[0];
            let reply_id = u16::from_be_bytes([buf[4], buf[5]]);
            let reply_seq = u16::from_be_bytes([buf[6], buf[7]]);
            // ICMPv6 type 129 = Echo Reply
            reply_type == 129 && reply_id == identifier && reply_seq == sequence
        }
    }
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    // Checksum at [2..4], computed later
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    // Fill payload with timestamp
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // Compute checksum
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0; // Code: 0
    // Checksum at [2..4] - kernel computes this for ICMPv6
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    // Fill payload with timestamp
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() - 1 {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }

    // Handle odd byte
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run the check via command execution (fallback).
async fn run_ping_command(
    address: &str,
    count: u32,
    timeout: Duration,
) -> Result<PingOutcome, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args([
            "-c",
            &count.to_string(),
            "-W",
            &timeout_secs.to_string(),
            address,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    // ping exits non-zero on 100% loss, which is still a valid outcome;
    // only fail when the summary line cannot be found at all.
    match parse_ping_output(&stdout, count) {
        Some(outcome) => Ok(outcome),
        None => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProbeError::Command(format!(
                "failed to parse ping output: {}{}",
                stdout, stderr
            )))
        }
    }
}

/// Parse ping command output into an outcome.
fn parse_ping_output(output: &str, expected_count: u32) -> Option<PingOutcome> {
    // Summary line: "N packets transmitted, M received" (Linux) or
    // "N packets transmitted, M packets received" (macOS)
    static RE_PACKETS: OnceLock<Regex> = OnceLock::new();
    let re_packets = RE_PACKETS.get_or_init(|| {
        Regex::new(r"(?P<sent>\d+) packets transmitted,\s*(?P<recv>\d+)(?: packets)? received")
            .unwrap()
    });

    let caps = re_packets.captures(output)?;
    let sent: u32 = caps.name("sent")?.as_str().parse().ok()?;
    let received: u32 = caps.name("recv")?.as_str().parse().ok()?;
    let sent = if sent == 0 { expected_count } else { sent };

    if received == 0 {
        return Some(PingOutcome::lost(sent));
    }

    // "rtt min/avg/max/mdev = a/b/c/d ms" (Linux) or
    // "round-trip min/avg/max/stddev = a/b/c/d ms" (macOS)
    static RE_RTT: OnceLock<Regex> = OnceLock::new();
    let re_rtt = RE_RTT.get_or_init(|| {
        Regex::new(
            r"(?:rtt|round-trip)\s+min/avg/max/\w+\s*=\s*(?P<min>[0-9.]+)/(?P<avg>[0-9.]+)/(?P<max>[0-9.]+)",
        )
        .unwrap()
    });

    let rtt = re_rtt.captures(output)?;
    let min: f64 = rtt.name("min")?.as_str().parse().ok()?;
    let avg: f64 = rtt.name("avg")?.as_str().parse().ok()?;
    let max: f64 = rtt.name("max")?.as_str().parse().ok()?;

    Some(PingOutcome {
        packets_sent: sent,
        packets_received: received,
        min_latency_ms: Some(min),
        max_latency_ms: Some(max),
        avg_latency_ms: Some(avg),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum() {
        // Test with a known packet
        let mut packet = vec![0u8; 8];
        packet[0] = 8; // Echo request
        packet[1] = 0; // Code
        // Checksum will be computed
        packet[4] = 0x12; // ID high
        packet[5] = 0x34; // ID low
        packet[6] = 0x00; // Seq high
        packet[7] = 0x01; // Seq low

        let checksum = icmp_checksum(&packet);
        // Verify checksum is non-zero and reasonable
        assert_ne!(checksum, 0);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms

--- 8.8.8.8 ping statistics ---
10 packets transmitted, 9 received, 10% packet loss, time 9012ms
rtt min/avg/max/mdev = 10.500/12.300/15.200/1.100 ms"#;
        let outcome = parse_ping_output(output, 10).unwrap();
        assert_eq!(outcome.packets_sent, 10);
        assert_eq!(outcome.packets_received, 9);
        assert_eq!(outcome.min_latency_ms, Some(10.5));
        assert_eq!(outcome.avg_latency_ms, Some(12.3));
        assert_eq!(outcome.max_latency_ms, Some(15.2));
    }

    #[test]
    fn test_parse_ping_output_macos() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
10 packets transmitted, 10 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/18.120/19.001/0.330 ms"#;
        let outcome = parse_ping_output(output, 10).unwrap();
        assert_eq!(outcome.packets_sent, 10);
        assert_eq!(outcome.packets_received, 10);
        assert_eq!(outcome.avg_latency_ms, Some(18.12));
    }

    #[test]
    fn test_parse_ping_output_total_loss() {
        let output = r#"PING 10.255.255.1 (10.255.255.1) 56(84) bytes of data.

--- 10.255.255.1 ping statistics ---
10 packets transmitted, 0 received, 100% packet loss, time 9213ms"#;
        let outcome = parse_ping_output(output, 10).unwrap();
        assert_eq!(outcome, PingOutcome::lost(10));
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(parse_ping_output("no summary line here", 10).is_none());
    }
}
