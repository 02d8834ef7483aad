use serde::Serialize;
use std::fmt;
use std::io::{self, Write};
use std::net::Ipv4Addr;

use rxtrace_common::{HookPoint, InvalidHookPoint, PacketEvent};

/// Why a ring buffer entry was not a usable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Short(usize),
    BadHook(InvalidHookPoint),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Short(len) => write!(
                f,
                "record of {} bytes, expected {}",
                len,
                PacketEvent::SIZE
            ),
            DecodeError::BadHook(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Checks size and hook tag of one ring buffer entry.
pub fn decode(bytes: &[u8]) -> Result<PacketEvent, DecodeError> {
    let event = PacketEvent::from_bytes(bytes).ok_or(DecodeError::Short(bytes.len()))?;
    event.hook().map_err(DecodeError::BadHook)?;
    Ok(event)
}

/// Human-facing view of a [`PacketEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct EventLine {
    pub timestamp_ns: u64,
    pub hook: HookPoint,
    pub correlation_key: u32,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub length: u32,
    pub cpu: u32,
    pub queue: u16,
}

impl EventLine {
    /// Addresses and ports arrive in network byte order; they are converted
    /// here and nowhere else. Records must have passed [`decode`].
    pub fn from_event(event: &PacketEvent) -> Option<Self> {
        Some(Self {
            timestamp_ns: event.timestamp_ns,
            hook: event.hook().ok()?,
            correlation_key: event.correlation_key,
            src_ip: Ipv4Addr::from(event.src_octets()),
            dst_ip: Ipv4Addr::from(event.dst_octets()),
            src_port: event.src_port(),
            dst_port: event.dst_port(),
            protocol: event.protocol().to_string(),
            length: event.length,
            cpu: event.cpu_id,
            queue: event.queue_id,
        })
    }
}

impl fmt::Display for EventLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>16} {:<13} key={:08x} {:<5} {}:{} -> {}:{} len={} cpu={} q={}",
            self.timestamp_ns,
            self.hook.name(),
            self.correlation_key,
            self.protocol,
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.length,
            self.cpu,
            self.queue,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

pub fn write_event<W: Write>(out: &mut W, event: &PacketEvent, format: OutputFormat) -> io::Result<()> {
    let Some(line) = EventLine::from_event(event) else {
        return Ok(());
    };
    match format {
        OutputFormat::Text => writeln!(out, "{}", line),
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &line)?;
            writeln!(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PacketEvent {
        PacketEvent {
            timestamp_ns: 42,
            correlation_key: 0xdead_beef,
            src_addr: u32::from_ne_bytes([10, 0, 0, 1]),
            dst_addr: u32::from_ne_bytes([192, 168, 1, 100]),
            src_port: 12345u16.to_be(),
            dst_port: 443u16.to_be(),
            protocol: 6,
            hook_point: HookPoint::TcpV4Rcv.tag(),
            length: 1500,
            cpu_id: 3,
            queue_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_valid() {
        let event = sample();
        assert_eq!(decode(event.as_bytes()), Ok(event));
    }

    #[test]
    fn test_decode_short() {
        let event = sample();
        assert_eq!(decode(&event.as_bytes()[..39]), Err(DecodeError::Short(39)));
        assert_eq!(decode(&[]), Err(DecodeError::Short(0)));
    }

    #[test]
    fn test_decode_bad_hook() {
        let mut event = sample();
        event.hook_point = 9;
        assert_eq!(
            decode(event.as_bytes()),
            Err(DecodeError::BadHook(InvalidHookPoint(9)))
        );
        event.hook_point = 0;
        assert!(decode(event.as_bytes()).is_err());
    }

    #[test]
    fn test_event_line_tcp() {
        let line = EventLine::from_event(&sample()).unwrap();
        assert_eq!(line.src_ip.to_string(), "10.0.0.1");
        assert_eq!(line.dst_ip.to_string(), "192.168.1.100");
        assert_eq!(line.src_port, 12345);
        assert_eq!(line.dst_port, 443);
        assert_eq!(line.protocol, "TCP");
        assert_eq!(line.hook, HookPoint::TcpV4Rcv);
        assert_eq!(line.length, 1500);
    }

    #[test]
    fn test_write_text() {
        let mut out = Vec::new();
        write_event(&mut out, &sample(), OutputFormat::Text).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("TCP_V4_RCV"));
        assert!(text.contains("10.0.0.1:12345 -> 192.168.1.100:443"));
        assert!(text.contains("key=deadbeef"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_write_json() {
        let mut out = Vec::new();
        write_event(&mut out, &sample(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["hook"], "TCP_V4_RCV");
        assert_eq!(value["src_ip"], "10.0.0.1");
        assert_eq!(value["dst_port"], 443);
        assert_eq!(value["protocol"], "TCP");
        assert_eq!(value["cpu"], 3);
    }
}
