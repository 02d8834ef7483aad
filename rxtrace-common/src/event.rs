//! Record layout shared by the hooks, the ring buffer and the consumer.

use core::{fmt, mem, ptr, str::FromStr};

/// Bumped whenever the field order or sizes of [`PacketEvent`] change.
pub const RECORD_VERSION: u32 = 1;

/// Reference capacity of the `EVENTS` ring buffer.
pub const RING_BUF_BYTES: u32 = 256 * 1024;

/// Entries in the `STATS` per-CPU array. Indexed by the hook tag, slot 0 unused.
pub const STATS_ENTRIES: u32 = 6;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// One observation of one packet at one hook point.
///
/// Fixed 40-byte layout with explicit padding so producer and consumer agree
/// on it regardless of optimisation settings. Addresses and ports are stored
/// exactly as they appear on the wire (network byte order); every other
/// scalar is in host order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct PacketEvent {
    /// Monotonic clock at the hook, in nanoseconds.
    pub timestamp_ns: u64,
    /// `src_addr ^ dst_addr ^ protocol`, see [`crate::flow_hash`].
    pub correlation_key: u32,
    /// Source IPv4 address in network byte order.
    pub src_addr: u32,
    /// Destination IPv4 address in network byte order.
    pub dst_addr: u32,
    /// Source port in network byte order, 0 when unavailable.
    pub src_port: u16,
    /// Destination port in network byte order, 0 when unavailable.
    pub dst_port: u16,
    /// IP protocol number, 0 when no IPv4 header was reached.
    pub protocol: u8,
    /// [`HookPoint`] tag.
    pub hook_point: u8,
    pub _pad1: u16,
    /// Observed frame length in bytes.
    pub length: u32,
    pub cpu_id: u32,
    /// Receive queue index, 0 if unknown at this hook.
    pub queue_id: u16,
    pub _pad2: u16,
}

const _: () = {
    assert!(mem::size_of::<PacketEvent>() == PacketEvent::SIZE);
    assert!(mem::align_of::<PacketEvent>() == 8);
    assert!(mem::offset_of!(PacketEvent, correlation_key) == 8);
    assert!(mem::offset_of!(PacketEvent, src_addr) == 12);
    assert!(mem::offset_of!(PacketEvent, dst_addr) == 16);
    assert!(mem::offset_of!(PacketEvent, src_port) == 20);
    assert!(mem::offset_of!(PacketEvent, dst_port) == 22);
    assert!(mem::offset_of!(PacketEvent, protocol) == 24);
    assert!(mem::offset_of!(PacketEvent, hook_point) == 25);
    assert!(mem::offset_of!(PacketEvent, length) == 28);
    assert!(mem::offset_of!(PacketEvent, cpu_id) == 32);
    assert!(mem::offset_of!(PacketEvent, queue_id) == 36);
};

impl PacketEvent {
    pub const SIZE: usize = 40;

    /// The record as the consumer sees it in the ring buffer.
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        // SAFETY: repr(C), size asserted above and every padding byte is an
        // explicit field, so all 40 bytes are initialised.
        unsafe { &*(self as *const Self as *const [u8; Self::SIZE]) }
    }

    /// Decodes a record from a ring-buffer sample. Returns `None` for samples
    /// shorter than [`PacketEvent::SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        // SAFETY: length checked above; every bit pattern is a valid
        // PacketEvent since all fields are plain integers.
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }

    pub fn hook(&self) -> Result<HookPoint, InvalidHookPoint> {
        HookPoint::try_from(self.hook_point)
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from_number(self.protocol)
    }

    /// Source port in host order.
    pub fn src_port(&self) -> u16 {
        u16::from_be(self.src_port)
    }

    /// Destination port in host order.
    pub fn dst_port(&self) -> u16 {
        u16::from_be(self.dst_port)
    }

    /// Source address octets in wire order.
    pub fn src_octets(&self) -> [u8; 4] {
        self.src_addr.to_ne_bytes()
    }

    /// Destination address octets in wire order.
    pub fn dst_octets(&self) -> [u8; 4] {
        self.dst_addr.to_ne_bytes()
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for PacketEvent {}

/// Where in the frame a hook's visible bytes begin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    /// Frame starts at the Ethernet header.
    Link,
    /// Frame starts at the IPv4 header.
    Network,
}

/// The five instrumented sites of the receive path.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum HookPoint {
    NicRx = 1,
    IpRcv = 2,
    IpRcvFinish = 3,
    TcpV4Rcv = 4,
    UdpRcv = 5,
}

impl HookPoint {
    pub const ALL: [HookPoint; 5] = [
        HookPoint::NicRx,
        HookPoint::IpRcv,
        HookPoint::IpRcvFinish,
        HookPoint::TcpV4Rcv,
        HookPoint::UdpRcv,
    ];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Identity used on the wire and in reports.
    pub const fn name(self) -> &'static str {
        match self {
            HookPoint::NicRx => "NIC_RX",
            HookPoint::IpRcv => "IP_RCV",
            HookPoint::IpRcvFinish => "IP_RCV_FINISH",
            HookPoint::TcpV4Rcv => "TCP_V4_RCV",
            HookPoint::UdpRcv => "UDP_RCV",
        }
    }

    /// Name of the eBPF program implementing this hook.
    pub const fn program_name(self) -> &'static str {
        match self {
            HookPoint::NicRx => "nic_rx",
            HookPoint::IpRcv => "ip_rcv",
            HookPoint::IpRcvFinish => "ip_rcv_finish",
            HookPoint::TcpV4Rcv => "tcp_v4_rcv",
            HookPoint::UdpRcv => "udp_rcv",
        }
    }

    /// `NIC_RX` sees the raw frame; every later stage has already consumed
    /// the link-layer header.
    pub const fn entry_layer(self) -> Layer {
        match self {
            HookPoint::NicRx => Layer::Link,
            _ => Layer::Network,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidHookPoint(pub u8);

impl fmt::Display for InvalidHookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid hook point tag {}", self.0)
    }
}

impl TryFrom<u8> for HookPoint {
    type Error = InvalidHookPoint;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(HookPoint::NicRx),
            2 => Ok(HookPoint::IpRcv),
            3 => Ok(HookPoint::IpRcvFinish),
            4 => Ok(HookPoint::TcpV4Rcv),
            5 => Ok(HookPoint::UdpRcv),
            other => Err(InvalidHookPoint(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownHookName;

impl fmt::Display for UnknownHookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown hook point, expected one of NIC_RX, IP_RCV, IP_RCV_FINISH, TCP_V4_RCV, UDP_RCV")
    }
}

impl FromStr for HookPoint {
    type Err = UnknownHookName;

    /// Accepts both the hook identity (`IP_RCV_FINISH`) and the program name
    /// (`ip_rcv_finish`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookPoint::ALL
            .into_iter()
            .find(|hook| {
                s.eq_ignore_ascii_case(hook.name()) || s.eq_ignore_ascii_case(hook.program_name())
            })
            .ok_or(UnknownHookName)
    }
}

/// Decoded view of the `protocol` byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl Protocol {
    pub const fn from_number(number: u8) -> Self {
        match number {
            IPPROTO_TCP => Protocol::Tcp,
            IPPROTO_UDP => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Other(1) => f.write_str("ICMP"),
            Protocol::Other(n) => write!(f, "IP({})", n),
        }
    }
}

/// Per-CPU emission counters, one slot per hook tag.
///
/// Every hook invocation bumps exactly one of the two fields, so
/// `published + dropped` is the number of packets the hook saw.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmitStats {
    pub published: u64,
    /// Ring buffer was full at reservation time.
    pub dropped: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for EmitStats {}

/// Byte offsets into `struct sk_buff` for the running kernel.
///
/// The kprobe hooks receive an `sk_buff` pointer and read it through
/// `bpf_probe_read_kernel`. Its layout varies across kernel builds, so the
/// agent writes the offsets into `SKB_LAYOUT` before attaching. An all-zero
/// layout means "unknown": the hooks then see an empty frame and still emit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct SkbLayout {
    /// `unsigned int len`
    pub len: u32,
    /// `__u16 queue_mapping`
    pub queue_mapping: u32,
    /// `unsigned char *head`
    pub head: u32,
    /// `sk_buff_data_t tail`, an offset from `head` on 64-bit kernels.
    pub tail: u32,
    /// `__u16 network_header`, an offset from `head`.
    pub network_header: u32,
}

impl SkbLayout {
    /// `head` is never the first member of `sk_buff`, so 0 marks an unset layout.
    pub const fn is_configured(&self) -> bool {
        self.head != 0
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for SkbLayout {}
